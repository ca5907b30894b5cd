//! vsock-exchange - one-shot byte-stream exchange over virtual-machine sockets.
//!
//! One endpoint binds, listens with a backlog of one, accepts a single peer and
//! drains the connection until the peer closes its sending side. The other
//! endpoint connects and transmits one fixed payload. Nothing flows back.
//!
//! Both endpoints are written against the [`Transport`] seam so the same code
//! runs over real `AF_VSOCK` sockets ([`VsockTransport`], Linux only) or over
//! the in-process [`LoopbackTransport`].
//!
//! # Example
//!
//! ```rust,ignore
//! use vsock_exchange::{run_client, run_server, ClientConfig, ServerConfig, VsockTransport};
//!
//! # fn main() -> vsock_exchange::Result<()> {
//! let transport = VsockTransport::new();
//!
//! // On the listening side
//! let report = run_server(&transport, &ServerConfig::default())?;
//! println!("drained {} bytes from {}", report.bytes_received, report.peer);
//!
//! // On the sending side
//! let sent = run_client(&transport, &ClientConfig::default())?;
//! println!("sent {} bytes", sent.bytes_sent);
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod client;
pub mod config;
pub mod error;
pub mod server;
pub mod socket;
pub mod transport;

// Re-export commonly used types
pub use address::AddressDescriptor;
pub use client::{run_client, ClientConfig, SendReport};
pub use config::{ExchangeConfig, LoopbackConfig};
pub use error::{outcome_code, ExchangeError, Result, Step};
pub use server::{run_server, DrainReport, Listener, Server, ServerConfig};
pub use socket::{SocketHandle, SocketState};
pub use transport::loopback::LoopbackTransport;
pub use transport::{SocketOps, Transport};

#[cfg(target_os = "linux")]
pub use transport::vsock::VsockTransport;
