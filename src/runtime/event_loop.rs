//! mio event loop engine.
//!
//! Readiness-based model: a single thread owns the poll, the listener and a
//! slab of connections. Poll tells us when sockets are ready, then we perform
//! non-blocking read/write syscalls and advance each connection's
//! `FrameState` until the socket would block. No call ever waits on one
//! particular connection.
//!
//! Sockets are registered for exactly one interest at a time: readable while
//! a frame is being received, writable only while an echo could not be
//! flushed in one go.

use crate::config::ServerConfig;
use crate::metrics::{CloseReason, Metrics};
use crate::runtime::{create_listener, Engine, EngineKind, FrameState, Phase, ReadStep};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Per-connection state owned by the poll thread.
struct EventConnection {
    stream: TcpStream,
    peer: SocketAddr,
    state: FrameState,
    /// Interest the stream is currently registered with.
    interest: Interest,
}

/// Where driving a connection stopped.
enum Drive {
    /// Socket would block; wait for this readiness.
    Wait(Interest),
    Close(CloseReason),
}

/// Single-threaded readiness engine.
pub struct EventLoopServer {
    poll: Poll,
    listener: TcpListener,
    connections: Slab<EventConnection>,
    metrics: Arc<Metrics>,
    buffer_size: usize,
    events_capacity: usize,
}

impl EventLoopServer {
    pub fn bind(addr: SocketAddr, config: &ServerConfig, metrics: Arc<Metrics>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr, config.backlog, true)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            connections: Slab::new(),
            metrics,
            buffer_size: config.buffer_size,
            events_capacity: config.events_capacity,
        })
    }

    fn serve(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.events_capacity);

        info!(
            buffer_size = self.buffer_size,
            events_capacity = self.events_capacity,
            "Event loop started"
        );

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    Token(conn_id) => self.handle_connection_event(conn_id),
                }
            }
        }
    }

    /// Accept every pending connection.
    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    self.metrics.record_accept();
                    self.register_connection(stream, peer);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn register_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to enable TCP_NODELAY");
        }

        let entry = self.connections.vacant_entry();
        let conn_id = entry.key();
        let conn = entry.insert(EventConnection {
            stream,
            peer,
            state: FrameState::new(self.buffer_size),
            interest: Interest::READABLE,
        });

        if let Err(e) = self
            .poll
            .registry()
            .register(&mut conn.stream, Token(conn_id), Interest::READABLE)
        {
            debug!(conn_id, error = %e, "Failed to register connection");
            self.close_connection(conn_id, CloseReason::InvalidStream);
            return;
        }

        trace!(conn_id, peer = %peer, "Accepted connection");
    }

    fn handle_connection_event(&mut self, conn_id: usize) {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };

        match drive(conn, &self.metrics) {
            Ok(Drive::Wait(interest)) => {
                if interest == conn.interest {
                    return;
                }
                conn.interest = interest;
                if let Err(e) =
                    self.poll
                        .registry()
                        .reregister(&mut conn.stream, Token(conn_id), interest)
                {
                    debug!(conn_id, error = %e, "Failed to reregister connection");
                    self.close_connection(conn_id, CloseReason::InvalidStream);
                }
            }
            Ok(Drive::Close(reason)) => self.close_connection(conn_id, reason),
            Err(e) => {
                debug!(conn_id, error = %e, "Connection error");
                self.close_connection(conn_id, CloseReason::InvalidStream);
            }
        }
    }

    fn close_connection(&mut self, conn_id: usize, reason: CloseReason) {
        let Some(mut conn) = self.connections.try_remove(conn_id) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut conn.stream);
        self.metrics.record_close(reason);

        if reason == CloseReason::Violation {
            warn!(
                conn_id,
                peer = %conn.peer,
                declared = conn.state.declared_len(),
                capacity = conn.state.capacity(),
                "Frame exceeds buffer capacity, abandoning connection"
            );
        } else {
            debug!(conn_id, peer = %conn.peer, ?reason, "Connection closed");
        }
        // Dropping the stream closes the socket.
    }
}

/// Advance a connection as far as the socket allows.
///
/// Reads target only the bytes missing from the current phase; a completed
/// body is echoed with as many sends as the socket needs, after which the
/// connection goes straight back to reading the next header.
fn drive(conn: &mut EventConnection, metrics: &Metrics) -> io::Result<Drive> {
    loop {
        match conn.state.phase() {
            Phase::ReadingHeader | Phase::ReadingBody => {
                let n = match conn.stream.read(conn.state.read_target()) {
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Drive::Wait(Interest::READABLE));
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                };
                metrics.record_read();

                match conn.state.advance_read(n) {
                    ReadStep::NeedMore | ReadStep::Respond => {}
                    ReadStep::Close(reason) => return Ok(Drive::Close(reason)),
                }
            }
            Phase::WritingResponse => {
                let n = match conn.stream.write(conn.state.write_source()) {
                    Ok(0) => {
                        return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                    }
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Drive::Wait(Interest::WRITABLE));
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                };
                metrics.record_write();
                conn.state.advance_write(n);
            }
        }
    }
}

impl Engine for EventLoopServer {
    fn kind(&self) -> EngineKind {
        EngineKind::EventLoop
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn run(mut self: Box<Self>) -> io::Result<()> {
        self.serve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support;

    #[test]
    fn test_event_loop_protocol() {
        test_support::check_protocol(EngineKind::EventLoop);
    }

    #[test]
    fn test_event_loop_stalled_peer() {
        test_support::check_stalled_peer(EngineKind::EventLoop);
    }

    #[test]
    fn test_event_loop_back_pressure() {
        test_support::check_back_pressure(EngineKind::EventLoop);
    }

    #[test]
    fn test_event_loop_concurrent_clients() {
        test_support::check_concurrent_clients(EngineKind::EventLoop, 64, 50);
    }
}
