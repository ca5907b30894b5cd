//! Transport seam.
//!
//! Endpoints only talk to sockets through [`Transport`] and [`SocketOps`],
//! which follow the BSD socket calls one to one. Backends:
//!
//! - [`vsock::VsockTransport`] - kernel `AF_VSOCK` stream sockets (Linux)
//! - [`loopback::LoopbackTransport`] - in-process, same observable semantics
//!
//! Implementations report failures as plain [`std::io::Error`]s; the
//! [`crate::SocketHandle`] wrapper attaches the step and address.

pub mod loopback;
#[cfg(target_os = "linux")]
pub mod vsock;

use crate::address::AddressDescriptor;
use std::io;
use std::net::Shutdown;

/// Factory for sockets of one address family.
pub trait Transport {
    type Socket: SocketOps;

    /// Create an unbound, unconnected stream socket.
    fn socket(&self) -> io::Result<Self::Socket>;

    /// Short backend name used in logs.
    fn name(&self) -> &'static str;
}

/// Blocking stream-socket operations.
pub trait SocketOps: Sized + Send {
    fn bind(&self, addr: &AddressDescriptor) -> io::Result<()>;

    fn listen(&self, backlog: u32) -> io::Result<()>;

    /// Block until a peer connects; returns the connection socket and the
    /// peer's address.
    fn accept(&self) -> io::Result<(Self, AddressDescriptor)>;

    fn connect(&self, addr: &AddressDescriptor) -> io::Result<()>;

    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Returns `Ok(0)` once the peer has shut down its sending side and all
    /// buffered bytes were consumed.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn shutdown(&self, how: Shutdown) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<AddressDescriptor>;
}
