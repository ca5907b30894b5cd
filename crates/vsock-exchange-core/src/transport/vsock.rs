//! Kernel `AF_VSOCK` stream sockets.
//!
//! Built on `nix::sys::socket`. Sockets created here are held as [`OwnedFd`];
//! connections returned by accept come back as raw descriptors and are closed
//! when the [`VsockSocket`] is dropped, whether or not it was shut down first.

use super::{SocketOps, Transport};
use crate::address::{AddressDescriptor, AddressRole};
use nix::errno::Errno;
use nix::sys::socket::{self, AddressFamily, Backlog, MsgFlags, SockFlag, SockType, VsockAddr};
use nix::unistd;
use std::io;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tracing::{trace, warn};

fn to_vsock_addr(addr: &AddressDescriptor) -> VsockAddr {
    VsockAddr::new(addr.cid(), addr.port())
}

fn from_vsock_addr(addr: &VsockAddr, role: AddressRole) -> AddressDescriptor {
    match role {
        AddressRole::Peer => AddressDescriptor::peer(addr.cid(), addr.port()),
        AddressRole::Remote => AddressDescriptor::remote(addr.cid(), addr.port()),
        AddressRole::Bind => AddressDescriptor::bind(addr.cid(), addr.port()),
        AddressRole::Local => AddressDescriptor::local(addr.cid(), addr.port()),
    }
}

/// Transport over the host kernel's vsock implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct VsockTransport;

impl VsockTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for VsockTransport {
    type Socket = VsockSocket;

    fn socket(&self) -> io::Result<VsockSocket> {
        let fd = socket::socket(
            AddressFamily::Vsock,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        trace!("Opened vsock fd {}", fd.as_raw_fd());
        Ok(VsockSocket {
            fd: Descriptor::Created(fd),
        })
    }

    fn name(&self) -> &'static str {
        "vsock"
    }
}

#[derive(Debug)]
enum Descriptor {
    /// Returned by socket(); closed by `OwnedFd`.
    Created(OwnedFd),
    /// Returned by accept4(); closed on drop.
    Accepted(RawFd),
}

impl Descriptor {
    fn raw(&self) -> RawFd {
        match self {
            Descriptor::Created(fd) => fd.as_raw_fd(),
            Descriptor::Accepted(fd) => *fd,
        }
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        if let Descriptor::Accepted(fd) = self {
            if let Err(e) = unistd::close(*fd) {
                warn!("Failed to close accepted vsock fd {}: {}", fd, e);
            }
        }
    }
}

/// An `AF_VSOCK` stream socket.
#[derive(Debug)]
pub struct VsockSocket {
    fd: Descriptor,
}

impl SocketOps for VsockSocket {
    fn bind(&self, addr: &AddressDescriptor) -> io::Result<()> {
        socket::bind(self.fd.raw(), &to_vsock_addr(addr))?;
        Ok(())
    }

    fn listen(&self, backlog: u32) -> io::Result<()> {
        let Descriptor::Created(fd) = &self.fd else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "accepted connections cannot listen",
            ));
        };
        let backlog = Backlog::new(i32::try_from(backlog).unwrap_or(i32::MAX))?;
        socket::listen(fd, backlog)?;
        Ok(())
    }

    fn accept(&self) -> io::Result<(VsockSocket, AddressDescriptor)> {
        let raw = loop {
            match socket::accept4(self.fd.raw(), SockFlag::SOCK_CLOEXEC) {
                Ok(fd) => break fd,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        };
        let conn = VsockSocket {
            fd: Descriptor::Accepted(raw),
        };
        let peer = socket::getpeername::<VsockAddr>(raw)?;
        Ok((conn, from_vsock_addr(&peer, AddressRole::Peer)))
    }

    fn connect(&self, addr: &AddressDescriptor) -> io::Result<()> {
        socket::connect(self.fd.raw(), &to_vsock_addr(addr))?;
        Ok(())
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        Ok(socket::send(self.fd.raw(), buf, MsgFlags::MSG_NOSIGNAL)?)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(socket::recv(self.fd.raw(), buf, MsgFlags::empty())?)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let how = match how {
            Shutdown::Read => socket::Shutdown::Read,
            Shutdown::Write => socket::Shutdown::Write,
            Shutdown::Both => socket::Shutdown::Both,
        };
        socket::shutdown(self.fd.raw(), how)?;
        Ok(())
    }

    fn local_addr(&self) -> io::Result<AddressDescriptor> {
        let addr = socket::getsockname::<VsockAddr>(self.fd.raw())?;
        Ok(from_vsock_addr(&addr, AddressRole::Local))
    }
}
