//! echo-bench: three ways to serve the same TCP echo protocol
//!
//! Engines, each on its own port:
//! - Cooperative: tokio task per connection
//! - Event loop: single mio poll thread with explicit per-connection state
//! - Thread pool: blocking worker per connection from a fixed pool
//!
//! The benchmark client drives identical load against each engine in turn
//! and reports throughput and error counts.

mod bench;
mod codec;
mod config;
mod metrics;
mod runtime;

use bench::BenchConfig;
use config::{Config, Mode};
use metrics::Metrics;
use runtime::thread_pool::PoolUsage;
use runtime::{EngineKind, RunningEngine};
use std::io::BufRead;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        mode = ?config.mode,
        host = %config.server.host,
        buffer_size = config.server.buffer_size,
        thread_pool_size = config.server.thread_pool_size,
        "Starting echo-bench"
    );

    if config.payload_len > config.server.buffer_size {
        warn!(
            payload_len = config.payload_len,
            buffer_size = config.server.buffer_size,
            "Payload exceeds server buffer; every request will be rejected"
        );
    }

    match config.mode {
        Mode::Server => run_server(&config),
        Mode::Client(ip) => run_client(&config, ip),
        Mode::Both => run_both(&config),
    }
}

/// Serve on all three ports until the process is killed.
fn run_server(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let engines = runtime::start_all(&config.server)?;
    spawn_stats_console(engine_metrics(&engines))?;

    for engine in engines {
        let _ = engine.handle.join();
    }
    Ok(())
}

fn run_client(config: &Config, ip: IpAddr) -> Result<(), Box<dyn std::error::Error>> {
    let targets: Vec<_> = EngineKind::ALL
        .iter()
        .map(|&kind| (kind, SocketAddr::new(ip, kind.addr(&config.server).port())))
        .collect();
    benchmark(config, &targets)
}

/// Servers on background threads, then the client in the foreground.
fn run_both(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let engines = runtime::start_all(&config.server)?;
    spawn_stats_console(engine_metrics(&engines))?;

    thread::sleep(Duration::from_millis(config.startup_delay_ms));

    let targets: Vec<_> = engines.iter().map(|e| (e.kind, e.addr)).collect();
    benchmark(config, &targets)?;

    for engine in &engines {
        let snap = engine.metrics.snapshot();
        println!("{} : {}", snap, engine.kind);
        if !snap.is_consistent() {
            warn!(engine = %engine.kind, "Close counters do not add up");
        }
    }
    // Engine threads are never joined; returning ends the process.
    Ok(())
}

fn benchmark(
    config: &Config,
    targets: &[(EngineKind, SocketAddr)],
) -> Result<(), Box<dyn std::error::Error>> {
    let bench = BenchConfig::from_config(config);

    println!("Connections : {}", bench.concurrency);
    println!("Payload     : {}", bench.payload_len);
    println!("Count       : {}", bench.loop_count);

    let reports = bench::run(targets, &bench, config.client_workers)?;
    for report in &reports {
        println!("{report}");
    }
    println!("done.");
    Ok(())
}

/// Counter and pool handles for the stats console.
struct EngineStats {
    kind: EngineKind,
    metrics: Arc<Metrics>,
    pool_usage: Option<Arc<PoolUsage>>,
}

fn engine_metrics(engines: &[RunningEngine]) -> Vec<EngineStats> {
    engines
        .iter()
        .map(|e| EngineStats {
            kind: e.kind,
            metrics: Arc::clone(&e.metrics),
            pool_usage: e.pool_usage.clone(),
        })
        .collect()
}

/// Print every engine's counters, and worker occupancy where the engine has
/// a pool, each time a line arrives on stdin.
fn spawn_stats_console(engines: Vec<EngineStats>) -> std::io::Result<()> {
    thread::Builder::new()
        .name("stats-console".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                if line.is_err() {
                    break;
                }
                for engine in &engines {
                    println!("{} : {}", engine.metrics.snapshot(), engine.kind);
                    if let Some(usage) = &engine.pool_usage {
                        println!("Thread: {} : {}", usage, engine.kind);
                    }
                }
            }
        })?;
    Ok(())
}
