//! Tokio engine: one task per connection.
//!
//! Each connection is a single sequential `async fn`. It suspends only at
//! its reads and writes, so at most one I/O operation is outstanding per
//! connection and frames are handled strictly in arrival order. Tasks are
//! multiplexed over a multi-thread runtime with a fixed worker count.

use crate::codec::{self, Header, HEADER_SIZE};
use crate::config::ServerConfig;
use crate::metrics::{CloseReason, Metrics};
use crate::runtime::{accept_error_is_transient, create_listener, num_cpus, Engine, EngineKind, ACCEPT_BACKOFF};
use futures::FutureExt;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Async task-per-connection engine.
pub struct CooperativeServer {
    listener: std::net::TcpListener,
    metrics: Arc<Metrics>,
    buffer_size: usize,
    workers: usize,
}

impl CooperativeServer {
    pub fn bind(addr: SocketAddr, config: &ServerConfig, metrics: Arc<Metrics>) -> io::Result<Self> {
        // Tokio adopts the socket as-is, so it must already be non-blocking.
        let listener = create_listener(addr, config.backlog, true)?;
        let workers = match config.cooperative_workers {
            Some(0) | None => num_cpus(),
            Some(n) => n,
        };

        Ok(Self {
            listener,
            metrics,
            buffer_size: config.buffer_size,
            workers,
        })
    }

    /// Accept connections and spawn a handler task for each.
    async fn accept_loop(self) -> io::Result<()> {
        let listener = TcpListener::from_std(self.listener)?;

        info!(
            workers = self.workers,
            buffer_size = self.buffer_size,
            "Cooperative runtime started"
        );

        loop {
            match listener.accept().await {
                Ok((mut stream, peer)) => {
                    self.metrics.record_accept();
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to enable TCP_NODELAY");
                    }

                    let metrics = Arc::clone(&self.metrics);
                    let capacity = self.buffer_size;
                    tokio::spawn(async move {
                        let reason = serve_connection(&mut stream, &metrics, capacity).await;
                        debug!(peer = %peer, ?reason, "Connection closed");
                    });
                }
                Err(ref e) if accept_error_is_transient(e) => continue,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

impl Engine for CooperativeServer {
    fn kind(&self) -> EngineKind {
        EngineKind::Cooperative
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn run(self: Box<Self>) -> io::Result<()> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.workers)
            .thread_name("cooperative-worker")
            .enable_all()
            .build()?;
        runtime.block_on(self.accept_loop())
    }
}

/// Serve one connection to completion and record how it closed.
///
/// A panic inside the handler is caught here so the close is still counted,
/// as an invalid-stream close.
async fn serve_connection<S>(stream: &mut S, metrics: &Metrics, capacity: usize) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reason = match AssertUnwindSafe(handle_connection(stream, metrics, capacity))
        .catch_unwind()
        .await
    {
        Ok(reason) => reason,
        Err(_) => {
            warn!("Task panicked while handling connection");
            CloseReason::InvalidStream
        }
    };
    metrics.record_close(reason);
    reason
}

/// Serve frames on one connection until it closes, returning why.
pub async fn handle_connection<S>(stream: &mut S, metrics: &Metrics, capacity: usize) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; capacity];

    loop {
        let mut header = [0u8; HEADER_SIZE];
        if let Err(reason) = fill(stream, &mut header, metrics).await {
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
        if let Err(reason) = fill(stream, body, metrics).await {
            return reason;
        }

        let mut sent = 0;
        while sent < len {
            match stream.write(&body[sent..]).await {
                Ok(0) => {
                    debug!("Write returned 0");
                    return CloseReason::InvalidStream;
                }
                Ok(n) => {
                    metrics.record_write();
                    sent += n;
                }
                Err(e) => {
                    debug!(error = %e, "Write failed");
                    return CloseReason::InvalidStream;
                }
            }
        }
    }
}

/// Read exactly `buf.len()` bytes, one suspension per read.
async fn fill<S>(stream: &mut S, buf: &mut [u8], metrics: &Metrics) -> Result<(), CloseReason>
where
    S: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await.map_err(|e| {
            debug!(error = %e, "Read failed");
            CloseReason::InvalidStream
        })?;
        metrics.record_read();
        if n == 0 {
            return Err(CloseReason::InvalidStream);
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_header, CLOSE_FRAME};
    use crate::codec::encode_frame;
    use crate::runtime::test_support;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::ReadBuf;
    use tokio_test::io::Builder;

    /// Transport whose first read panics.
    struct PanickingStream;

    impl AsyncRead for PanickingStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            panic!("transport fault");
        }
    }

    impl AsyncWrite for PanickingStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_split_reads_and_writes() {
        // The pause makes the mock accept only "hel" from the first write,
        // so the echo has to resume from offset 3.
        let mut mock = Builder::new()
            .read(&[5, 0])
            .read(&[0, 0])
            .read(b"he")
            .read(b"llo")
            .write(b"hel")
            .wait(Duration::ZERO)
            .write(b"lo")
            .read(&encode_header(2))
            .read(b"ok")
            .write(b"ok")
            .read(&CLOSE_FRAME)
            .build();

        let metrics = Metrics::new();
        let reason = handle_connection(&mut mock, &metrics, 16).await;
        assert_eq!(reason, CloseReason::Peer);

        let snap = metrics.snapshot();
        assert_eq!(snap.read, 7);
        assert_eq!(snap.written, 3);
    }

    #[tokio::test]
    async fn test_short_writes_over_narrow_pipe() {
        // Each direction of the pipe buffers at most 3 bytes.
        let (mut client, mut server) = tokio::io::duplex(3);
        let metrics = Metrics::new();
        let payload = b"hello world";

        let serve = handle_connection(&mut server, &metrics, 16);
        let drive = async {
            client.write_all(&encode_frame(payload)).await.unwrap();
            let mut echoed = vec![0u8; payload.len()];
            client.read_exact(&mut echoed).await.unwrap();
            client.write_all(&CLOSE_FRAME).await.unwrap();
            echoed
        };
        let (reason, echoed) = tokio::join!(serve, drive);

        assert_eq!(reason, CloseReason::Peer);
        assert_eq!(echoed, payload);
        assert!(metrics.snapshot().written >= 4);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let metrics = Metrics::new();
        let reason = serve_connection(&mut PanickingStream, &metrics, 16).await;

        assert_eq!(reason, CloseReason::InvalidStream);
        let snap = metrics.snapshot();
        assert_eq!(snap.closed, 1);
        assert_eq!(snap.closed_invalid, 1);
        assert!(snap.is_consistent());
    }

    #[tokio::test]
    async fn test_eof_mid_body() {
        let mut mock = Builder::new().read(&encode_header(5)).read(b"ab").build();

        let metrics = Metrics::new();
        let reason = handle_connection(&mut mock, &metrics, 16).await;
        assert_eq!(reason, CloseReason::InvalidStream);
    }

    #[tokio::test]
    async fn test_oversized_frame_gets_no_response() {
        let mut mock = Builder::new().read(&encode_header(17)).build();

        let metrics = Metrics::new();
        let reason = handle_connection(&mut mock, &metrics, 16).await;
        assert_eq!(reason, CloseReason::Violation);
        assert_eq!(metrics.snapshot().written, 0);
    }

    #[tokio::test]
    async fn test_transport_error_is_invalid_stream() {
        let mut mock = Builder::new()
            .read(&encode_header(3))
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let metrics = Metrics::new();
        let reason = handle_connection(&mut mock, &metrics, 16).await;
        assert_eq!(reason, CloseReason::InvalidStream);
    }

    #[test]
    fn test_cooperative_protocol() {
        test_support::check_protocol(EngineKind::Cooperative);
    }

    #[test]
    fn test_cooperative_stalled_peer() {
        test_support::check_stalled_peer(EngineKind::Cooperative);
    }

    #[test]
    fn test_cooperative_back_pressure() {
        test_support::check_back_pressure(EngineKind::Cooperative);
    }

    #[test]
    fn test_cooperative_concurrent_clients() {
        test_support::check_concurrent_clients(EngineKind::Cooperative, 64, 50);
    }
}
