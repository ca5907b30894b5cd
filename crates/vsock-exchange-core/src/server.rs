//! Server endpoint: accept one peer and drain it.
//!
//! The run is split in two so callers can learn when the server is ready:
//! [`Server::listen`] creates, binds and listens; [`Listener::accept_and_drain`]
//! accepts exactly one connection, reads until the peer closes, and shuts the
//! connection down. [`run_server`] does both in one call.
//!
//! A zero-length receive ends the drain loop normally. Receive errors abort
//! the run with [`ExchangeError::Recv`]; they never count as end of stream.

use crate::address::AddressDescriptor;
use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, Result};
use crate::socket::SocketHandle;
use crate::transport::{SocketOps, Transport};
use serde::Serialize;
use tracing::{debug, info, trace};

/// Server endpoint settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Local address to bind the listening socket to.
    pub bind: AddressDescriptor,
    /// Listen backlog.
    pub backlog: u32,
    /// Receive buffer size for the drain loop.
    pub recv_buf_len: usize,
}

impl ServerConfig {
    /// Bind to `(cid, port)` with the default backlog and buffer size.
    pub fn new(cid: u32, port: u32) -> Self {
        Self {
            bind: AddressDescriptor::bind(cid, port),
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: AddressDescriptor::bind(ExchangeConfig::SERVER_BIND_CID, ExchangeConfig::PORT),
            backlog: ExchangeConfig::LISTEN_BACKLOG,
            recv_buf_len: ExchangeConfig::RECV_BUF_LEN,
        }
    }
}

/// What a completed server run observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub local: AddressDescriptor,
    pub peer: AddressDescriptor,
    /// Total bytes read (and discarded) before end of stream.
    pub bytes_received: usize,
    /// Number of non-empty receives.
    pub reads: usize,
}

/// Entry point for the listening side.
pub struct Server;

impl Server {
    /// Create a socket, bind it to `config.bind` and start listening.
    pub fn listen<T: Transport>(transport: &T, config: &ServerConfig) -> Result<Listener<T::Socket>> {
        let mut socket = SocketHandle::create(transport)?;
        socket.bind(&config.bind)?;
        socket.listen(config.backlog)?;

        let local = socket.local_addr().unwrap_or(config.bind);
        info!(
            "Listening on {} over {} (backlog {})",
            local,
            transport.name(),
            config.backlog
        );

        Ok(Listener {
            socket,
            local,
            recv_buf_len: config.recv_buf_len.max(1),
        })
    }
}

/// A bound, listening server socket waiting for its one peer.
#[derive(Debug)]
pub struct Listener<S: SocketOps> {
    socket: SocketHandle<S>,
    local: AddressDescriptor,
    recv_buf_len: usize,
}

impl<S: SocketOps> Listener<S> {
    pub fn local_addr(&self) -> AddressDescriptor {
        self.local
    }

    /// Accept one connection, drain it until the peer closes, shut it down.
    ///
    /// Consumes the listener; only one peer is ever served. The listening
    /// socket is released when this returns.
    pub fn accept_and_drain(mut self) -> Result<DrainReport> {
        let (mut conn, peer) = self.socket.accept()?;
        info!("Client accepted: {}", peer);

        let mut buf = vec![0u8; self.recv_buf_len];
        let mut bytes_received = 0usize;
        let mut reads = 0usize;

        loop {
            let n = conn.recv(&mut buf)?;
            if n == 0 {
                debug!("Peer {} closed its sending side", peer);
                break;
            }
            reads += 1;
            bytes_received += n;
            debug!("Received {} bytes from {}", n, peer);
            trace!("recv: {:?}", &buf[..n]);
        }

        conn.shutdown()?;
        info!("Drained {} bytes from {} in {} reads", bytes_received, peer, reads);

        Ok(DrainReport {
            local: self.local,
            peer,
            bytes_received,
            reads,
        })
    }
}

/// Run the whole server side: listen, accept one peer, drain, shut down.
pub fn run_server<T: Transport>(transport: &T, config: &ServerConfig) -> Result<DrainReport> {
    Server::listen(transport, config)?.accept_and_drain()
}

/// Whether a server error means the peer closed the connection abruptly
/// rather than a local failure.
pub fn is_peer_reset(err: &ExchangeError) -> bool {
    matches!(
        err.io_error().map(|e| e.kind()),
        Some(std::io::ErrorKind::ConnectionReset) | Some(std::io::ErrorKind::ConnectionAborted)
    )
}
