//! Per-engine connection counters.
//!
//! One `Metrics` is created per engine and shared through an `Arc` with every
//! handler context that engine runs. All counters only ever increase.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent the zero-length header.
    Peer,
    /// Peer disconnected mid-frame or the transport failed.
    InvalidStream,
    /// Declared body length exceeded the buffer capacity.
    Violation,
}

/// Thread-safe counters for one engine.
#[derive(Debug, Default)]
pub struct Metrics {
    accepted: AtomicU64,
    read: AtomicU64,
    written: AtomicU64,
    closed: AtomicU64,
    closed_by_peer: AtomicU64,
    closed_invalid: AtomicU64,
    closed_violation: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one completed read call (including a zero-byte read).
    pub fn record_read(&self) {
        self.read.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one successful send call.
    pub fn record_write(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a closed connection under exactly one reason.
    pub fn record_close(&self, reason: CloseReason) {
        let counter = match reason {
            CloseReason::Peer => &self.closed_by_peer,
            CloseReason::InvalidStream => &self.closed_invalid,
            CloseReason::Violation => &self.closed_violation,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            read: self.read.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            closed_by_peer: self.closed_by_peer.load(Ordering::Relaxed),
            closed_invalid: self.closed_invalid.load(Ordering::Relaxed),
            closed_violation: self.closed_violation.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of an engine's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub accepted: u64,
    pub read: u64,
    pub written: u64,
    pub closed: u64,
    pub closed_by_peer: u64,
    pub closed_invalid: u64,
    pub closed_violation: u64,
}

impl MetricsSnapshot {
    /// Every close is attributed to exactly one reason.
    pub fn is_consistent(&self) -> bool {
        self.closed == self.closed_by_peer + self.closed_invalid + self.closed_violation
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "accept({}) close({}) peer({}) + invalid({}) + violation({}) read({}) write({})",
            self.accepted,
            self.closed,
            self.closed_by_peer,
            self.closed_invalid,
            self.closed_violation,
            self.read,
            self.written
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_close_reasons_sum_to_closed() {
        let metrics = Metrics::new();
        metrics.record_close(CloseReason::Peer);
        metrics.record_close(CloseReason::Peer);
        metrics.record_close(CloseReason::InvalidStream);
        metrics.record_close(CloseReason::Violation);

        let snap = metrics.snapshot();
        assert_eq!(snap.closed, 4);
        assert_eq!(snap.closed_by_peer, 2);
        assert_eq!(snap.closed_invalid, 1);
        assert_eq!(snap.closed_violation, 1);
        assert!(snap.is_consistent());
    }

    #[test]
    fn test_concurrent_increments() {
        let metrics = Metrics::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_accept();
                        metrics.record_read();
                        metrics.record_write();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = metrics.snapshot();
        assert_eq!(snap.accepted, 8000);
        assert_eq!(snap.read, 8000);
        assert_eq!(snap.written, 8000);
    }

    #[test]
    fn test_display() {
        let metrics = Metrics::new();
        metrics.record_accept();
        metrics.record_close(CloseReason::Peer);
        assert_eq!(
            metrics.snapshot().to_string(),
            "accept(1) close(1) peer(1) + invalid(0) + violation(0) read(0) write(0)"
        );
    }
}
