//! In-process loopback transport.
//!
//! Reproduces the stream-socket behavior the endpoints depend on without a
//! kernel vsock device:
//!
//! - binding an endpoint that is already bound fails with `AddrInUse`
//! - connecting to an endpoint with no listener fails with `ConnectionRefused`
//! - a listener queues at most `backlog` not-yet-accepted connections; further
//!   attempts are refused
//! - `recv` returns `Ok(0)` once the peer shut down its write side (or was
//!   dropped) and the buffered bytes are consumed
//! - sockets that connect without binding get ephemeral ports counting up
//!   from [`LoopbackConfig::EPHEMERAL_PORT_START`]
//!
//! Clones of a [`LoopbackTransport`] share one endpoint registry, so a server
//! and a client on different threads see each other.

use super::{SocketOps, Transport};
use crate::address::{AddressDescriptor, CID_ANY, PORT_ANY};
use crate::config::LoopbackConfig;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::Shutdown;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

type EndpointKey = (u32, u32);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cond.wait(guard).unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Byte pipe (one direction of a connection)
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PipeState {
    buf: VecDeque<u8>,
    write_closed: bool,
    read_closed: bool,
}

#[derive(Debug, Default)]
struct Pipe {
    state: Mutex<PipeState>,
    ready: Condvar,
}

impl Pipe {
    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.write_closed || state.read_closed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        state.buf.extend(data);
        self.ready.notify_all();
        Ok(data.len())
    }

    fn read(&self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut state = lock(&self.state);
        loop {
            if !state.buf.is_empty() {
                let n = out.len().min(state.buf.len());
                for (slot, byte) in out.iter_mut().zip(state.buf.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            if state.write_closed || state.read_closed {
                return Ok(0);
            }
            state = wait(&self.ready, state);
        }
    }

    fn close_write(&self) {
        lock(&self.state).write_closed = true;
        self.ready.notify_all();
    }

    fn close_read(&self) {
        let mut state = lock(&self.state);
        state.read_closed = true;
        state.buf.clear();
        self.ready.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Listen queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PendingConn {
    local: AddressDescriptor,
    peer: AddressDescriptor,
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<PendingConn>,
    backlog: usize,
    closed: bool,
}

#[derive(Debug)]
struct ListenQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl ListenQueue {
    fn new(backlog: u32) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                backlog: backlog.max(1) as usize,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        for conn in state.pending.drain(..) {
            conn.rx.close_read();
            conn.tx.close_write();
        }
        self.ready.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RegistryState {
    /// Bound endpoints; `Some` once the endpoint is listening.
    endpoints: HashMap<EndpointKey, Option<Arc<ListenQueue>>>,
    next_port: u32,
}

/// In-process transport; all clones share one endpoint registry.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    local_cid: u32,
    registry: Arc<Mutex<RegistryState>>,
}

impl LoopbackTransport {
    /// Create a transport whose sockets live in context `local_cid`.
    pub fn new(local_cid: u32) -> Self {
        Self {
            local_cid,
            registry: Arc::new(Mutex::new(RegistryState {
                endpoints: HashMap::new(),
                next_port: LoopbackConfig::EPHEMERAL_PORT_START,
            })),
        }
    }

    pub fn local_cid(&self) -> u32 {
        self.local_cid
    }

    /// Number of currently bound endpoints (listening or not).
    pub fn bound_endpoints(&self) -> usize {
        lock(&self.registry).endpoints.len()
    }

    fn allocate_port(state: &mut RegistryState, cid: u32) -> u32 {
        loop {
            let port = state.next_port;
            state.next_port = match state.next_port.wrapping_add(1) {
                PORT_ANY => LoopbackConfig::EPHEMERAL_PORT_START,
                next => next,
            };
            if !state.endpoints.contains_key(&(cid, port)) {
                return port;
            }
        }
    }

    fn release(&self, key: EndpointKey) {
        lock(&self.registry).endpoints.remove(&key);
        trace!("Released loopback endpoint {}:{}", key.0, key.1);
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new(LoopbackConfig::DEFAULT_CID)
    }
}

impl Transport for LoopbackTransport {
    type Socket = LoopbackSocket;

    fn socket(&self) -> io::Result<LoopbackSocket> {
        Ok(LoopbackSocket {
            transport: self.clone(),
            slot: Mutex::new(Slot::Fresh),
        })
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Slot {
    Fresh,
    Bound(AddressDescriptor),
    Listening {
        local: AddressDescriptor,
        queue: Arc<ListenQueue>,
    },
    Connected {
        local: AddressDescriptor,
        rx: Arc<Pipe>,
        tx: Arc<Pipe>,
        /// Accepted connections share the listener's endpoint and must not
        /// release it.
        owns_endpoint: bool,
    },
    Closed,
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message.to_string())
}

fn not_connected() -> io::Error {
    io::Error::from(io::ErrorKind::NotConnected)
}

fn key_of(addr: &AddressDescriptor) -> EndpointKey {
    (addr.cid(), addr.port())
}

/// Socket created by [`LoopbackTransport`].
#[derive(Debug)]
pub struct LoopbackSocket {
    transport: LoopbackTransport,
    slot: Mutex<Slot>,
}

impl LoopbackSocket {
    fn connection_pipes(&self) -> io::Result<(Arc<Pipe>, Arc<Pipe>)> {
        match &*lock(&self.slot) {
            Slot::Connected { rx, tx, .. } => Ok((rx.clone(), tx.clone())),
            _ => Err(not_connected()),
        }
    }
}

impl SocketOps for LoopbackSocket {
    fn bind(&self, addr: &AddressDescriptor) -> io::Result<()> {
        let mut slot = lock(&self.slot);
        if !matches!(*slot, Slot::Fresh) {
            return Err(invalid("socket is already bound"));
        }

        let cid = if addr.cid() == CID_ANY {
            self.transport.local_cid
        } else {
            addr.cid()
        };

        let mut registry = lock(&self.transport.registry);
        let port = if addr.port() == PORT_ANY {
            LoopbackTransport::allocate_port(&mut registry, cid)
        } else {
            addr.port()
        };

        if registry.endpoints.contains_key(&(cid, port)) {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }
        registry.endpoints.insert((cid, port), None);

        let local = AddressDescriptor::local(cid, port);
        debug!("Loopback socket bound to {}", local);
        *slot = Slot::Bound(local);
        Ok(())
    }

    fn listen(&self, backlog: u32) -> io::Result<()> {
        let mut slot = lock(&self.slot);
        let local = match &*slot {
            Slot::Bound(local) => *local,
            _ => return Err(invalid("socket is not bound")),
        };

        let queue = Arc::new(ListenQueue::new(backlog));
        lock(&self.transport.registry)
            .endpoints
            .insert(key_of(&local), Some(queue.clone()));

        *slot = Slot::Listening { local, queue };
        Ok(())
    }

    fn accept(&self) -> io::Result<(LoopbackSocket, AddressDescriptor)> {
        let queue = match &*lock(&self.slot) {
            Slot::Listening { queue, .. } => queue.clone(),
            _ => return Err(invalid("socket is not listening")),
        };

        let conn = {
            let mut state = lock(&queue.state);
            loop {
                if let Some(conn) = state.pending.pop_front() {
                    break conn;
                }
                if state.closed {
                    return Err(io::Error::from(io::ErrorKind::ConnectionAborted));
                }
                state = wait(&queue.ready, state);
            }
        };

        let socket = LoopbackSocket {
            transport: self.transport.clone(),
            slot: Mutex::new(Slot::Connected {
                local: conn.local,
                rx: conn.rx,
                tx: conn.tx,
                owns_endpoint: false,
            }),
        };
        Ok((socket, conn.peer))
    }

    fn connect(&self, addr: &AddressDescriptor) -> io::Result<()> {
        let mut slot = lock(&self.slot);
        let bound = match &*slot {
            Slot::Fresh => None,
            Slot::Bound(local) => Some(*local),
            _ => return Err(invalid("socket is already connected or listening")),
        };

        let (queue, local) = {
            let mut registry = lock(&self.transport.registry);
            let queue = match registry.endpoints.get(&key_of(addr)) {
                Some(Some(queue)) => queue.clone(),
                _ => return Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
            };
            let local = match bound {
                Some(local) => local,
                None => {
                    let cid = self.transport.local_cid;
                    let port = LoopbackTransport::allocate_port(&mut registry, cid);
                    registry.endpoints.insert((cid, port), None);
                    AddressDescriptor::local(cid, port)
                }
            };
            (queue, local)
        };

        let c2s = Arc::new(Pipe::default());
        let s2c = Arc::new(Pipe::default());
        {
            let mut state = lock(&queue.state);
            if state.closed || state.pending.len() >= state.backlog {
                debug!(
                    "Refusing loopback connection to {}: backlog full ({})",
                    addr, state.backlog
                );
                drop(state);
                if bound.is_none() {
                    self.transport.release(key_of(&local));
                }
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            state.pending.push_back(PendingConn {
                local: AddressDescriptor::local(addr.cid(), addr.port()),
                peer: AddressDescriptor::peer(local.cid(), local.port()),
                rx: c2s.clone(),
                tx: s2c.clone(),
            });
            queue.ready.notify_one();
        }

        debug!("Loopback socket {} connected to {}", local, addr);
        *slot = Slot::Connected {
            local,
            rx: s2c,
            tx: c2s,
            owns_endpoint: true,
        };
        Ok(())
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let (_, tx) = self.connection_pipes()?;
        tx.write(buf)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (rx, _) = self.connection_pipes()?;
        rx.read(buf)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let (rx, tx) = self.connection_pipes()?;
        match how {
            Shutdown::Read => rx.close_read(),
            Shutdown::Write => tx.close_write(),
            Shutdown::Both => {
                rx.close_read();
                tx.close_write();
            }
        }
        Ok(())
    }

    fn local_addr(&self) -> io::Result<AddressDescriptor> {
        match &*lock(&self.slot) {
            Slot::Fresh => Ok(AddressDescriptor::local(self.transport.local_cid, PORT_ANY)),
            Slot::Bound(local)
            | Slot::Listening { local, .. }
            | Slot::Connected { local, .. } => Ok(*local),
            Slot::Closed => Err(not_connected()),
        }
    }
}

impl Drop for LoopbackSocket {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(|e| e.into_inner());
        match std::mem::replace(slot, Slot::Closed) {
            Slot::Bound(local) => self.transport.release(key_of(&local)),
            Slot::Listening { local, queue } => {
                queue.close();
                self.transport.release(key_of(&local));
            }
            Slot::Connected {
                local,
                rx,
                tx,
                owns_endpoint,
            } => {
                tx.close_write();
                rx.close_read();
                if owns_endpoint {
                    self.transport.release(key_of(&local));
                }
            }
            Slot::Fresh | Slot::Closed => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn listener(transport: &LoopbackTransport, port: u32, backlog: u32) -> LoopbackSocket {
        let sock = transport.socket().unwrap();
        sock.bind(&AddressDescriptor::bind(transport.local_cid(), port))
            .unwrap();
        sock.listen(backlog).unwrap();
        sock
    }

    #[test]
    fn test_bind_in_use() {
        let transport = LoopbackTransport::new(3);
        let _first = listener(&transport, 1234, 1);

        let second = transport.socket().unwrap();
        let err = second.bind(&AddressDescriptor::bind(3, 1234)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[test]
    fn test_connect_without_listener_is_refused() {
        let transport = LoopbackTransport::new(3);
        let sock = transport.socket().unwrap();
        let err = sock.connect(&AddressDescriptor::remote(3, 1234)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        // Bound but not listening is refused too.
        let bound = transport.socket().unwrap();
        bound.bind(&AddressDescriptor::bind(3, 1234)).unwrap();
        let err = sock.connect(&AddressDescriptor::remote(3, 1234)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn test_backlog_of_one() {
        let transport = LoopbackTransport::new(3);
        let server = listener(&transport, 1234, 1);
        let target = AddressDescriptor::remote(3, 1234);

        let first = transport.socket().unwrap();
        first.connect(&target).unwrap();

        let second = transport.socket().unwrap();
        let err = second.connect(&target).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        // Accepting frees the slot.
        let (_conn, _peer) = server.accept().unwrap();
        let third = transport.socket().unwrap();
        third.connect(&target).unwrap();
    }

    #[test]
    fn test_ephemeral_ports_and_peer_address() {
        let transport = LoopbackTransport::new(7);
        let server = listener(&transport, 1234, 4);

        let client = transport.socket().unwrap();
        client.connect(&AddressDescriptor::remote(7, 1234)).unwrap();
        let local = client.local_addr().unwrap();
        assert_eq!(local.port(), LoopbackConfig::EPHEMERAL_PORT_START);
        assert_eq!(local.cid(), 7);

        let (conn, peer) = server.accept().unwrap();
        assert!(peer.same_endpoint(&local));
        assert_eq!(conn.local_addr().unwrap().port(), 1234);
    }

    #[test]
    fn test_recv_zero_after_peer_shutdown() {
        let transport = LoopbackTransport::new(3);
        let server = listener(&transport, 1234, 1);

        let client = transport.socket().unwrap();
        client.connect(&AddressDescriptor::remote(3, 1234)).unwrap();
        assert_eq!(client.send(b"hello").unwrap(), 5);
        client.shutdown(Shutdown::Both).unwrap();

        let (conn, _) = server.accept().unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(conn.recv(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(conn.recv(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(conn.recv(&mut buf).unwrap(), 0);
        assert_eq!(conn.recv(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_send_after_shutdown_is_broken_pipe() {
        let transport = LoopbackTransport::new(3);
        let _server = listener(&transport, 1234, 1);

        let client = transport.socket().unwrap();
        client.connect(&AddressDescriptor::remote(3, 1234)).unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        let err = client.send(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_dropping_client_ends_stream() {
        let transport = LoopbackTransport::new(3);
        let server = listener(&transport, 1234, 1);

        let client = transport.socket().unwrap();
        client.connect(&AddressDescriptor::remote(3, 1234)).unwrap();
        client.send(b"abc").unwrap();
        drop(client);

        let (conn, _) = server.accept().unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(conn.recv(&mut buf).unwrap(), 3);
        assert_eq!(conn.recv(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_accept_blocks_until_connect() {
        let transport = LoopbackTransport::new(3);
        let server = listener(&transport, 1234, 1);

        let handle = thread::spawn(move || {
            let (conn, peer) = server.accept().unwrap();
            let mut buf = [0u8; 16];
            let n = conn.recv(&mut buf).unwrap();
            (peer, buf[..n].to_vec())
        });

        let client = transport.socket().unwrap();
        client.connect(&AddressDescriptor::remote(3, 1234)).unwrap();
        client.send(b"ping").unwrap();

        let (peer, data) = handle.join().unwrap();
        assert_eq!(data, b"ping");
        assert_eq!(peer.cid(), 3);
    }

    #[test]
    fn test_dropping_sockets_releases_endpoints() {
        let transport = LoopbackTransport::new(3);
        let server = listener(&transport, 1234, 1);
        let client = transport.socket().unwrap();
        client.connect(&AddressDescriptor::remote(3, 1234)).unwrap();
        let (conn, _) = server.accept().unwrap();
        assert_eq!(transport.bound_endpoints(), 2);

        drop(conn);
        assert_eq!(transport.bound_endpoints(), 2);
        drop(client);
        drop(server);
        assert_eq!(transport.bound_endpoints(), 0);

        // The port can be bound again.
        let _again = listener(&transport, 1234, 1);
    }

    #[test]
    fn test_bind_any_uses_local_cid() {
        let transport = LoopbackTransport::new(9);
        let sock = transport.socket().unwrap();
        sock.bind(&AddressDescriptor::bind(CID_ANY, 1234)).unwrap();
        let local = sock.local_addr().unwrap();
        assert_eq!(local.cid(), 9);
        assert_eq!(local.port(), 1234);
    }
}
