//! Blocking engine: one pool worker per connection.
//!
//! The accept loop hands each connection to a fixed set of worker threads
//! through a zero-capacity channel. A send only completes once a worker is
//! idle, so while every worker is busy the accept loop stalls holding one
//! accepted connection, and anything beyond `thread_pool_size + 1` waits in
//! the listen backlog. At most `thread_pool_size` connections are served at
//! once.

use crate::codec::{self, Header, HEADER_SIZE};
use crate::config::ServerConfig;
use crate::metrics::{CloseReason, Metrics};
use crate::runtime::{accept_error_is_transient, create_listener, Engine, EngineKind, ACCEPT_BACKOFF};
use crossbeam::channel::{self, Receiver};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// How many pool workers are currently serving a connection.
#[derive(Debug)]
pub struct PoolUsage {
    busy: AtomicUsize,
    size: usize,
}

impl PoolUsage {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            busy: AtomicUsize::new(0),
            size,
        })
    }

    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Display for PoolUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker({}/{})", self.busy(), self.size)
    }
}

/// Fixed-size blocking worker pool engine.
pub struct ThreadPoolServer {
    listener: TcpListener,
    metrics: Arc<Metrics>,
    usage: Arc<PoolUsage>,
    buffer_size: usize,
}

impl ThreadPoolServer {
    pub fn bind(addr: SocketAddr, config: &ServerConfig, metrics: Arc<Metrics>) -> io::Result<Self> {
        let listener = create_listener(addr, config.backlog, false)?;

        Ok(Self {
            listener,
            metrics,
            usage: PoolUsage::new(config.thread_pool_size.max(1)),
            buffer_size: config.buffer_size,
        })
    }

    fn serve(self) -> io::Result<()> {
        let (handoff, connections) = channel::bounded::<(TcpStream, SocketAddr)>(0);

        for worker_id in 0..self.usage.size() {
            let connections = connections.clone();
            let metrics = Arc::clone(&self.metrics);
            let usage = Arc::clone(&self.usage);
            let capacity = self.buffer_size;
            thread::Builder::new()
                .name(format!("pool-worker-{worker_id}"))
                .spawn(move || worker_loop(connections, &metrics, &usage, capacity))?;
        }

        info!(
            pool_size = self.usage.size(),
            buffer_size = self.buffer_size,
            "Thread pool started"
        );

        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    self.metrics.record_accept();
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to enable TCP_NODELAY");
                    }
                    // Blocks until a worker is free.
                    if handoff.send((stream, peer)).is_err() {
                        return Err(io::Error::new(
                            io::ErrorKind::Other,
                            "all pool workers have exited",
                        ));
                    }
                }
                Err(ref e) if accept_error_is_transient(e) => continue,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }
    }
}

impl Engine for ThreadPoolServer {
    fn kind(&self) -> EngineKind {
        EngineKind::ThreadPool
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn pool_usage(&self) -> Option<Arc<PoolUsage>> {
        Some(Arc::clone(&self.usage))
    }

    fn run(self: Box<Self>) -> io::Result<()> {
        (*self).serve()
    }
}

fn worker_loop(
    connections: Receiver<(TcpStream, SocketAddr)>,
    metrics: &Metrics,
    usage: &PoolUsage,
    capacity: usize,
) {
    for (mut stream, peer) in connections.iter() {
        usage.busy.fetch_add(1, Ordering::Relaxed);
        let reason = serve_connection(&mut stream, metrics, capacity);
        usage.busy.fetch_sub(1, Ordering::Relaxed);
        debug!(peer = %peer, ?reason, "Connection closed");
    }
}

/// Serve one connection to completion and record how it closed.
///
/// A panic while handling is contained here: the connection is counted as
/// an invalid-stream close and the worker goes back to the pool.
fn serve_connection<S: Read + Write>(stream: &mut S, metrics: &Metrics, capacity: usize) -> CloseReason {
    let reason = match panic::catch_unwind(AssertUnwindSafe(|| {
        handle_stream(stream, metrics, capacity)
    })) {
        Ok(reason) => reason,
        Err(_) => {
            warn!("Worker panicked while handling connection");
            CloseReason::InvalidStream
        }
    };
    metrics.record_close(reason);
    reason
}

/// Blocking frame loop for a single connection.
fn handle_stream<S: Read + Write>(stream: &mut S, metrics: &Metrics, capacity: usize) -> CloseReason {
    let mut buffer = vec![0u8; capacity];

    loop {
        let mut header = [0u8; HEADER_SIZE];
        if let Err(reason) = fill(stream, &mut header, metrics) {
            return reason;
        }

        let len = match codec::classify(codec::decode_header(header), capacity) {
            Header::Close => return CloseReason::Peer,
            Header::Oversized(declared) => {
                warn!(declared, capacity, "Frame exceeds buffer capacity, abandoning connection");
                return CloseReason::Violation;
            }
            Header::Body(len) => len,
        };

        let body = &mut buffer[..len];
        if let Err(reason) = fill(stream, body, metrics) {
            return reason;
        }

        let mut sent = 0;
        while sent < len {
            match stream.write(&body[sent..]) {
                Ok(0) => {
                    debug!("Write returned 0");
                    return CloseReason::InvalidStream;
                }
                Ok(n) => {
                    metrics.record_write();
                    sent += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "Write failed");
                    return CloseReason::InvalidStream;
                }
            }
        }
    }
}

/// Read exactly `buf.len()` bytes, advancing by what each read returned.
fn fill<S: Read>(stream: &mut S, buf: &mut [u8], metrics: &Metrics) -> Result<(), CloseReason> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = match stream.read(&mut buf[filled..]) {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "Read failed");
                return Err(CloseReason::InvalidStream);
            }
        };
        metrics.record_read();
        if n == 0 {
            return Err(CloseReason::InvalidStream);
        }
        filled += n;
    }
    Ok(())
}
