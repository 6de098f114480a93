//! Server engines.
//!
//! Three implementations of the same echo protocol that differ only in how
//! they schedule work:
//! - `event_loop`: one mio poll thread driving non-blocking state machines
//! - `cooperative`: one tokio task per connection on a bounded runtime
//! - `thread_pool`: one blocking worker per connection from a fixed pool
//!
//! All of them share:
//! - `codec`: frame header encoding and capacity classification
//! - `Metrics`: counters injected at construction
//! - `FrameState`: the explicit per-connection state machine (event loop)

mod connection;
pub mod cooperative;
pub mod event_loop;
pub mod thread_pool;

pub(crate) use connection::{FrameState, Phase, ReadStep};

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thread_pool::PoolUsage;
use tracing::{error, info};

/// Pause after an accept error that is not about one particular connection,
/// such as running out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Which scheduling model an engine uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    EventLoop,
    Cooperative,
    ThreadPool,
}

impl EngineKind {
    pub const ALL: [EngineKind; 3] = [
        EngineKind::Cooperative,
        EngineKind::EventLoop,
        EngineKind::ThreadPool,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EngineKind::EventLoop => "EventLoopServer",
            EngineKind::Cooperative => "CooperativeServer",
            EngineKind::ThreadPool => "ThreadPoolServer",
        }
    }

    /// Fixed listening address for this engine.
    pub fn addr(&self, config: &ServerConfig) -> SocketAddr {
        match self {
            EngineKind::EventLoop => config.event_loop_addr(),
            EngineKind::Cooperative => config.cooperative_addr(),
            EngineKind::ThreadPool => config.thread_pool_addr(),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A bound server engine.
///
/// Binding happens at construction so setup failures surface before any
/// thread is spawned; `run` then serves until the process exits.
pub trait Engine: Send {
    fn kind(&self) -> EngineKind;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn metrics(&self) -> &Arc<Metrics>;

    /// Worker occupancy, for engines that serve from a fixed pool.
    fn pool_usage(&self) -> Option<Arc<PoolUsage>> {
        None
    }

    /// Serve connections. Only returns on an unrecoverable error.
    fn run(self: Box<Self>) -> io::Result<()>;
}

/// Bind the engine of `kind` on `addr`.
pub fn bind(
    kind: EngineKind,
    addr: SocketAddr,
    config: &ServerConfig,
    metrics: Arc<Metrics>,
) -> io::Result<Box<dyn Engine>> {
    let engine: Box<dyn Engine> = match kind {
        EngineKind::EventLoop => Box::new(event_loop::EventLoopServer::bind(addr, config, metrics)?),
        EngineKind::Cooperative => Box::new(cooperative::CooperativeServer::bind(addr, config, metrics)?),
        EngineKind::ThreadPool => Box::new(thread_pool::ThreadPoolServer::bind(addr, config, metrics)?),
    };
    Ok(engine)
}

/// Handle to an engine running on its own thread.
pub struct RunningEngine {
    pub kind: EngineKind,
    pub addr: SocketAddr,
    pub metrics: Arc<Metrics>,
    pub pool_usage: Option<Arc<PoolUsage>>,
    pub handle: thread::JoinHandle<()>,
}

/// Run an engine on a dedicated named thread.
pub fn spawn(engine: Box<dyn Engine>) -> io::Result<RunningEngine> {
    let kind = engine.kind();
    let addr = engine.local_addr()?;
    let metrics = Arc::clone(engine.metrics());
    let pool_usage = engine.pool_usage();

    info!(engine = %kind, addr = %addr, "Engine listening");

    let handle = thread::Builder::new()
        .name(kind.name().to_string())
        .spawn(move || {
            if let Err(e) = engine.run() {
                error!(engine = %kind, error = %e, "Engine failed");
            }
        })?;

    Ok(RunningEngine {
        kind,
        addr,
        metrics,
        pool_usage,
        handle,
    })
}

/// Bind and start all three engines on their configured ports.
pub fn start_all(config: &ServerConfig) -> io::Result<Vec<RunningEngine>> {
    EngineKind::ALL
        .iter()
        .map(|&kind| {
            let engine = bind(kind, kind.addr(config), config, Metrics::new())?;
            spawn(engine)
        })
        .collect()
}

/// Create a bound, listening TCP socket.
fn create_listener(addr: SocketAddr, backlog: i32, nonblocking: bool) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(nonblocking)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Errors that concern only the connection being accepted; the next accept
/// can be attempted right away.
fn accept_error_is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_ports() {
        let config = ServerConfig::default();
        assert_eq!(EngineKind::Cooperative.addr(&config).port(), 17001);
        assert_eq!(EngineKind::EventLoop.addr(&config).port(), 17002);
        assert_eq!(EngineKind::ThreadPool.addr(&config).port(), 17003);
    }

    #[test]
    fn test_bind_conflict_fails_setup() {
        let engine = test_support::start(EngineKind::EventLoop);
        let err = bind(
            EngineKind::ThreadPool,
            engine.addr,
            &test_support::test_config(),
            Metrics::new(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_accept_error_classification() {
        for kind in [io::ErrorKind::ConnectionAborted, io::ErrorKind::Interrupted] {
            assert!(accept_error_is_transient(&io::Error::from(kind)));
        }
        // EMFILE surfaces as a raw OS error with no dedicated kind.
        assert!(!accept_error_is_transient(&io::Error::from_raw_os_error(24)));
        assert!(!accept_error_is_transient(&io::Error::from(io::ErrorKind::OutOfMemory)));
    }
}
