//! Lifecycle-checked socket handle.
//!
//! [`SocketHandle`] wraps a transport socket and tracks which state it is in.
//! Every operation checks the current state first and fails with
//! [`ExchangeError::IllegalState`] when called out of order, before the
//! transport is touched.
//!
//! ```text
//! server: Created -> Bound -> Listening
//!                                 |  accept (new handle)
//!                                 v
//!                             Accepted -> Draining -> Shutdown
//! client: Created -> Connected -> Shutdown
//! ```

use crate::address::{AddressDescriptor, CID_ANY, PORT_ANY};
use crate::error::{ExchangeError, Result};
use crate::transport::{SocketOps, Transport};
use serde::Serialize;
use std::fmt;
use std::io;
use std::net::Shutdown;
use tracing::{debug, trace};

/// Lifecycle state of a [`SocketHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketState {
    Created,
    Bound,
    Listening,
    /// Connection handle returned by accept, nothing received yet.
    Accepted,
    /// Connection handle that has started receiving.
    Draining,
    Connected,
    Shutdown,
}

impl SocketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketState::Created => "created",
            SocketState::Bound => "bound",
            SocketState::Listening => "listening",
            SocketState::Accepted => "accepted",
            SocketState::Draining => "draining",
            SocketState::Connected => "connected",
            SocketState::Shutdown => "shutdown",
        }
    }

    /// Whether the handle carries a data connection.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            SocketState::Accepted | SocketState::Draining | SocketState::Connected
        )
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A transport socket owned by exactly one endpoint.
pub struct SocketHandle<S: SocketOps> {
    inner: S,
    state: SocketState,
    local: Option<AddressDescriptor>,
    peer: Option<AddressDescriptor>,
}

impl<S: SocketOps> SocketHandle<S> {
    /// Create a fresh socket on `transport`.
    pub fn create<T>(transport: &T) -> Result<Self>
    where
        T: Transport<Socket = S>,
    {
        let inner = transport
            .socket()
            .map_err(|source| ExchangeError::Socket { source })?;
        trace!("Created {} socket", transport.name());
        Ok(Self {
            inner,
            state: SocketState::Created,
            local: None,
            peer: None,
        })
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn peer_addr(&self) -> Option<AddressDescriptor> {
        self.peer
    }

    /// Local address as reported by the transport, falling back to the
    /// address the handle was bound to.
    pub fn local_addr(&self) -> Option<AddressDescriptor> {
        match self.inner.local_addr() {
            Ok(addr) => Some(addr),
            Err(e) => {
                debug!("Local address unavailable ({}), using bind address", e);
                self.local
            }
        }
    }

    fn expect_state(&self, op: &'static str, allowed: &[SocketState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ExchangeError::IllegalState {
                op,
                state: self.state,
            })
        }
    }

    fn local_or_any(&self) -> AddressDescriptor {
        self.local
            .unwrap_or_else(|| AddressDescriptor::local(CID_ANY, PORT_ANY))
    }

    fn peer_or_any(&self) -> AddressDescriptor {
        self.peer
            .unwrap_or_else(|| AddressDescriptor::peer(CID_ANY, PORT_ANY))
    }

    /// `Created -> Bound`.
    pub fn bind(&mut self, addr: &AddressDescriptor) -> Result<()> {
        self.expect_state("bind", &[SocketState::Created])?;
        self.inner.bind(addr).map_err(|source| ExchangeError::Bind {
            addr: *addr,
            source,
        })?;
        self.local = Some(*addr);
        self.state = SocketState::Bound;
        Ok(())
    }

    /// `Bound -> Listening`.
    pub fn listen(&mut self, backlog: u32) -> Result<()> {
        self.expect_state("listen", &[SocketState::Bound])?;
        self.inner
            .listen(backlog)
            .map_err(|source| ExchangeError::Listen {
                addr: self.local_or_any(),
                backlog,
                source,
            })?;
        self.state = SocketState::Listening;
        Ok(())
    }

    /// Block until one peer connects. The listening handle stays in
    /// `Listening`; the returned handle starts in `Accepted`.
    pub fn accept(&mut self) -> Result<(SocketHandle<S>, AddressDescriptor)> {
        self.expect_state("accept", &[SocketState::Listening])?;
        let (inner, peer) = self
            .inner
            .accept()
            .map_err(|source| ExchangeError::Accept {
                addr: self.local_or_any(),
                source,
            })?;
        let conn = SocketHandle {
            inner,
            state: SocketState::Accepted,
            local: self.local,
            peer: Some(peer),
        };
        Ok((conn, peer))
    }

    /// `Created -> Connected`.
    pub fn connect(&mut self, addr: &AddressDescriptor) -> Result<()> {
        self.expect_state("connect", &[SocketState::Created])?;
        self.inner
            .connect(addr)
            .map_err(|source| ExchangeError::Connect {
                addr: *addr,
                source,
            })?;
        self.peer = Some(*addr);
        self.state = SocketState::Connected;
        Ok(())
    }

    /// Single send call; returns the transport's byte count unchecked.
    pub fn send(&mut self, buf: &[u8]) -> Result<usize> {
        self.expect_state("send", &[SocketState::Connected])?;
        loop {
            match self.inner.send(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(ExchangeError::Send {
                        addr: self.peer_or_any(),
                        source,
                    })
                }
            }
        }
    }

    /// Single receive call. `Ok(0)` means the peer closed its sending side.
    ///
    /// An accepted handle moves to `Draining` on its first receive.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.expect_state(
            "recv",
            &[
                SocketState::Accepted,
                SocketState::Draining,
                SocketState::Connected,
            ],
        )?;
        if self.state == SocketState::Accepted {
            self.state = SocketState::Draining;
        }
        loop {
            match self.inner.recv(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(ExchangeError::Recv {
                        addr: self.peer_or_any(),
                        source,
                    })
                }
            }
        }
    }

    /// Disable further communication in both directions. Connection handles
    /// only; the listening handle is released on drop.
    pub fn shutdown(&mut self) -> Result<()> {
        if !self.state.is_connection() {
            return Err(ExchangeError::IllegalState {
                op: "shutdown",
                state: self.state,
            });
        }
        self.inner
            .shutdown(Shutdown::Both)
            .map_err(|source| ExchangeError::Shutdown {
                addr: self.peer_or_any(),
                source,
            })?;
        self.state = SocketState::Shutdown;
        Ok(())
    }
}

impl<S: SocketOps> fmt::Debug for SocketHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("state", &self.state)
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}
