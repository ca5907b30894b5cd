//! Centralized configuration for the exchange.
//!
//! Fixed values of the exchange (well-known ports and context identifiers,
//! buffer sizes, backlog, payload) live here as associated constants. The
//! runtime [`crate::ServerConfig`] and [`crate::ClientConfig`] defaults are
//! populated from these.

/// Exchange-level constants.
pub struct ExchangeConfig;

impl ExchangeConfig {
    /// Port used by both endpoints.
    pub const PORT: u32 = 1234;
    /// Context identifier the server binds to.
    pub const SERVER_BIND_CID: u32 = 33;
    /// Context identifier the client connects to (the host).
    pub const CLIENT_REMOTE_CID: u32 = 2;
    /// Pending-connection queue length for the listening socket.
    pub const LISTEN_BACKLOG: u32 = 1;
    /// Maximum bytes read by a single receive in the drain loop.
    pub const RECV_BUF_LEN: usize = 1024;
    /// Payload transmitted by the client.
    pub const PAYLOAD: &[u8] = b"hello";
}

/// Configuration for the in-process loopback transport.
pub struct LoopbackConfig;

impl LoopbackConfig {
    /// First port handed out to connecting sockets that never bound.
    pub const EPHEMERAL_PORT_START: u32 = 40000;
    /// Context identifier used by `pair` when none is given.
    pub const DEFAULT_CID: u32 = 3;
}
