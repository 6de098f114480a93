//! Benchmark driver.
//!
//! Runs the same client load against each engine in turn: `concurrency`
//! connections opened at once, each doing `loop_count` sequential echo round
//! trips of a fixed payload, then a graceful close. Failures are counted,
//! never fatal, so every engine gets a comparable report.

use crate::codec::{self, CLOSE_FRAME};
use crate::config::Config;
use crate::runtime::EngineKind;
use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Parameters of one benchmark session, fixed once it starts.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub concurrency: usize,
    pub loop_count: usize,
    pub payload_len: usize,
    /// Pause before each engine's session so the previous one's sockets drain.
    pub cooldown: Duration,
}

impl BenchConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.concurrency,
            loop_count: config.loop_count,
            payload_len: config.payload_len,
            cooldown: Duration::from_millis(config.cooldown_ms),
        }
    }

    pub fn total_requests(&self) -> u64 {
        (self.concurrency * self.loop_count) as u64
    }
}

/// Deterministic request payload: byte `i` is `(i + 1) mod 256`.
pub fn payload(len: usize) -> Vec<u8> {
    (1..=len).map(|i| i as u8).collect()
}

/// Outcome of one session against one engine.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub engine: EngineKind,
    pub requests: u64,
    pub elapsed: Duration,
    /// Connection failures plus payload mismatches.
    pub errors: u64,
}

impl SessionReport {
    pub fn requests_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.requests as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<18}: Request Per Seconds({:.0}) elapsed({:.2}s) error({})",
            self.engine.name(),
            self.requests_per_sec(),
            self.elapsed.as_secs_f64(),
            self.errors
        )
    }
}

/// Benchmark every target in order on a dedicated client runtime.
pub fn run(
    targets: &[(EngineKind, SocketAddr)],
    config: &BenchConfig,
    workers: Option<usize>,
) -> io::Result<Vec<SessionReport>> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = workers.filter(|&n| n > 0) {
        builder.worker_threads(workers);
    }
    let runtime = builder.thread_name("bench-client").enable_all().build()?;

    info!(
        connections = config.concurrency,
        payload = config.payload_len,
        count = config.loop_count,
        "Starting benchmark"
    );

    let reports = runtime.block_on(async {
        let mut reports = Vec::with_capacity(targets.len());
        for &(engine, addr) in targets {
            tokio::time::sleep(config.cooldown).await;
            let report = run_session(engine, addr, config).await;
            info!(
                engine = %engine,
                rps = report.requests_per_sec() as u64,
                elapsed_ms = report.elapsed.as_millis() as u64,
                errors = report.errors,
                "Session finished"
            );
            reports.push(report);
        }
        reports
    });
    Ok(reports)
}

/// Open all clients at once against `addr` and wait for every one to finish.
pub async fn run_session(engine: EngineKind, addr: SocketAddr, config: &BenchConfig) -> SessionReport {
    let payload = Bytes::from(payload(config.payload_len));
    let request = Bytes::from(codec::encode_frame(&payload));

    let start = Instant::now();
    let clients: Vec<_> = (0..config.concurrency)
        .map(|_| {
            tokio::spawn(run_client(
                addr,
                request.clone(),
                payload.clone(),
                config.loop_count,
            ))
        })
        .collect();

    let mut errors = 0;
    for client in clients {
        errors += client.await.unwrap_or_else(|e| {
            debug!(error = %e, "Client task failed");
            1
        });
    }

    SessionReport {
        engine,
        requests: config.total_requests(),
        elapsed: start.elapsed(),
        errors,
    }
}

/// One client connection; returns its error count.
async fn run_client(addr: SocketAddr, request: Bytes, payload: Bytes, loop_count: usize) -> u64 {
    let mut stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(addr = %addr, error = %e, "Connect failed");
            return 1;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to enable TCP_NODELAY");
    }

    let mut errors = 0;
    let mut echoed = vec![0u8; payload.len()];
    for _ in 0..loop_count {
        if let Err(e) = round_trip(&mut stream, &request, &mut echoed).await {
            debug!(addr = %addr, error = %e, "Round trip failed");
            return errors + 1;
        }
        if echoed[..] != payload[..] {
            errors += 1;
        }
    }

    if let Err(e) = stream.write_all(&CLOSE_FRAME).await {
        debug!(addr = %addr, error = %e, "Failed to send close frame");
        return errors + 1;
    }
    let _ = stream.shutdown().await;
    errors
}

/// Send one frame and read back exactly `echoed.len()` bytes.
async fn round_trip(stream: &mut TcpStream, request: &[u8], echoed: &mut [u8]) -> io::Result<()> {
    stream.write_all(request).await?;
    stream.read_exact(echoed).await?;
    Ok(())
}
