//! Deterministic simulation harness.
//!
//! An in-memory [`Net`] implementation plus a manually advanced clock, so
//! whole-mesh scenarios run single-threaded with seeded randomness and
//! simulated time. A [`Switchboard`] plays the network: it owns every
//! listener and connection endpoint and a per-node delivery queue the test
//! drains into `Gmcast::handle_up`.
//!
//! Connects are modeled like non-blocking TCP: they always hand back a
//! transport, and a dial to an address nobody listens on surfaces later as
//! a zero-length event on a closed transport.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::clock::Clock;
use crate::transport::{Fd, Listener, Net, Transport, TransportState};

// ── Clock ────────────────────────────────────────────────────────────────────

/// A clock that only moves when the test says so.
pub struct TestClock {
    base: Instant,
    offset: Cell<Duration>,
}

impl TestClock {
    pub fn new_rc() -> Rc<Self> {
        Rc::new(Self {
            base: Instant::now(),
            offset: Cell::new(Duration::ZERO),
        })
    }

    pub fn advance(&self, delta: Duration) {
        self.offset.set(self.offset.get() + delta);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base + self.offset.get()
    }
}

// ── Switchboard ──────────────────────────────────────────────────────────────

/// Index of a simulated node; one delivery queue each.
pub type NodeHandle = usize;

#[derive(Clone, Default)]
pub struct Switchboard {
    inner: Rc<RefCell<Inner>>,
}

#[derive(Default)]
struct Inner {
    next_fd: Fd,
    queues: Vec<VecDeque<(Fd, Bytes)>>,
    listeners: HashMap<String, ListenerSlot>,
    endpoints: HashMap<Fd, Endpoint>,
}

struct ListenerSlot {
    fd: Fd,
    node: NodeHandle,
    backlog: VecDeque<Fd>,
}

struct Endpoint {
    node: NodeHandle,
    peer: Option<Fd>,
    state: TransportState,
}

impl Switchboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self) -> NodeHandle {
        let mut inner = self.inner.borrow_mut();
        inner.queues.push(VecDeque::new());
        inner.queues.len() - 1
    }

    /// Take every queued event for `node`.
    pub fn drain(&self, node: NodeHandle) -> Vec<(Fd, Bytes)> {
        self.inner.borrow_mut().queues[node].drain(..).collect()
    }

    /// Close both ends of the connection `fd` belongs to; both owners get
    /// the transport-failure event.
    pub fn close_conn(&self, fd: Fd) {
        let mut inner = self.inner.borrow_mut();
        let peer = inner.endpoints.get(&fd).and_then(|ep| ep.peer);
        inner.close_endpoint(fd);
        if let Some(peer_fd) = peer {
            inner.close_endpoint(peer_fd);
        }
    }

    /// Simulate a node crash: its listener disappears, every connection it
    /// holds drops, its queue empties.
    pub fn kill_node(&self, node: NodeHandle) {
        let mut inner = self.inner.borrow_mut();

        let doomed_listeners: Vec<String> = inner
            .listeners
            .iter()
            .filter(|(_, slot)| slot.node == node)
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in doomed_listeners {
            if let Some(slot) = inner.listeners.remove(&addr) {
                for fd in slot.backlog {
                    inner.close_endpoint(fd);
                }
            }
        }

        let doomed_endpoints: Vec<Fd> = inner
            .endpoints
            .iter()
            .filter(|(_, ep)| ep.node == node)
            .map(|(&fd, _)| fd)
            .collect();
        for fd in doomed_endpoints {
            inner.close_endpoint(fd);
        }
        inner.queues[node].clear();
    }
}

impl Inner {
    fn alloc_fd(&mut self) -> Fd {
        self.next_fd += 1;
        self.next_fd
    }

    /// Mark an endpoint closed and break the news to its peer.
    fn close_endpoint(&mut self, fd: Fd) {
        let Some(ep) = self.endpoints.get_mut(&fd) else {
            return;
        };
        if ep.state == TransportState::Closed {
            return;
        }
        ep.state = TransportState::Closed;
        let peer = ep.peer;
        if let Some(peer_fd) = peer {
            if let Some(peer_ep) = self.endpoints.get_mut(&peer_fd) {
                if peer_ep.state != TransportState::Closed {
                    peer_ep.state = TransportState::Closed;
                    let peer_node = peer_ep.node;
                    self.queues[peer_node].push_back((peer_fd, Bytes::new()));
                }
            }
        }
    }
}

// ── Net implementation ───────────────────────────────────────────────────────

/// One node's window onto the switchboard.
pub struct MemNet {
    sb: Switchboard,
    node: NodeHandle,
}

impl MemNet {
    pub fn new(sb: Switchboard, node: NodeHandle) -> Self {
        Self { sb, node }
    }
}

impl Net for MemNet {
    fn listen(&mut self, addr: &str) -> io::Result<Box<dyn Listener>> {
        let mut inner = self.sb.inner.borrow_mut();
        if inner.listeners.contains_key(addr) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, addr.to_string()));
        }
        let fd = inner.alloc_fd();
        inner.listeners.insert(
            addr.to_string(),
            ListenerSlot {
                fd,
                node: self.node,
                backlog: VecDeque::new(),
            },
        );
        Ok(Box::new(MemListener {
            sb: self.sb.clone(),
            addr: addr.to_string(),
            fd,
        }))
    }

    fn connect(&mut self, addr: &str) -> io::Result<Box<dyn Transport>> {
        let mut inner = self.sb.inner.borrow_mut();
        let local_fd = inner.alloc_fd();

        match inner.listeners.get(addr).map(|s| (s.fd, s.node)) {
            Some((listener_fd, listener_node)) => {
                let remote_fd = inner.alloc_fd();
                inner.endpoints.insert(
                    local_fd,
                    Endpoint {
                        node: self.node,
                        peer: Some(remote_fd),
                        state: TransportState::Connected,
                    },
                );
                inner.endpoints.insert(
                    remote_fd,
                    Endpoint {
                        node: listener_node,
                        peer: Some(local_fd),
                        state: TransportState::Connected,
                    },
                );
                inner
                    .listeners
                    .get_mut(addr)
                    .expect("listener")
                    .backlog
                    .push_back(remote_fd);
                // Listener readiness for the acceptor, connected
                // notification for the dialer.
                inner.queues[listener_node].push_back((listener_fd, Bytes::new()));
                inner.queues[self.node].push_back((local_fd, Bytes::new()));
            }
            None => {
                // Nobody listening: the dial fails asynchronously, like a
                // non-blocking TCP connect.
                inner.endpoints.insert(
                    local_fd,
                    Endpoint {
                        node: self.node,
                        peer: None,
                        state: TransportState::Closed,
                    },
                );
                inner.queues[self.node].push_back((local_fd, Bytes::new()));
            }
        }
        Ok(Box::new(MemTransport {
            sb: self.sb.clone(),
            fd: local_fd,
        }))
    }
}

// ── Listener / transport handles ─────────────────────────────────────────────

struct MemListener {
    sb: Switchboard,
    addr: String,
    fd: Fd,
}

impl Listener for MemListener {
    fn fd(&self) -> Fd {
        self.fd
    }

    fn accept(&mut self) -> io::Result<Box<dyn Transport>> {
        let mut inner = self.sb.inner.borrow_mut();
        let slot = inner
            .listeners
            .get_mut(&self.addr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "listener closed"))?;
        let fd = slot
            .backlog
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "empty backlog"))?;
        Ok(Box::new(MemTransport {
            sb: self.sb.clone(),
            fd,
        }))
    }

    fn close(&mut self) {
        let mut inner = self.sb.inner.borrow_mut();
        if let Some(slot) = inner.listeners.remove(&self.addr) {
            if slot.fd == self.fd {
                for fd in slot.backlog {
                    inner.close_endpoint(fd);
                }
            } else {
                // Someone re-bound the address after us; put it back.
                inner.listeners.insert(self.addr.clone(), slot);
            }
        }
    }
}

struct MemTransport {
    sb: Switchboard,
    fd: Fd,
}

impl Transport for MemTransport {
    fn fd(&self) -> Fd {
        self.fd
    }

    fn state(&self) -> TransportState {
        self.sb
            .inner
            .borrow()
            .endpoints
            .get(&self.fd)
            .map(|ep| ep.state)
            .unwrap_or(TransportState::Closed)
    }

    fn send(&mut self, dg: &[u8]) -> io::Result<()> {
        let mut inner = self.sb.inner.borrow_mut();
        let ep = inner
            .endpoints
            .get(&self.fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no endpoint"))?;
        if ep.state != TransportState::Connected {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport not connected",
            ));
        }
        let peer_fd = ep
            .peer
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "half-open"))?;
        let (peer_node, peer_state) = inner
            .endpoints
            .get(&peer_fd)
            .map(|p| (p.node, p.state))
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))?;
        if peer_state != TransportState::Connected {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"));
        }
        inner.queues[peer_node].push_back((peer_fd, Bytes::copy_from_slice(dg)));
        Ok(())
    }

    fn close(&mut self) {
        self.sb.inner.borrow_mut().close_endpoint(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_manually() {
        let clock = TestClock::new_rc();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(3));
        assert_eq!(clock.now() - t0, Duration::from_secs(3));
    }

    #[test]
    fn connect_to_listener_delivers_both_notifications() {
        let sb = Switchboard::new();
        let a = sb.add_node();
        let b = sb.add_node();

        let mut net_a = MemNet::new(sb.clone(), a);
        let mut net_b = MemNet::new(sb.clone(), b);

        let listener = net_a.listen("tcp://10.0.0.1:1").unwrap();
        let tp = net_b.connect("tcp://10.0.0.1:1").unwrap();
        assert_eq!(tp.state(), TransportState::Connected);

        let events_a = sb.drain(a);
        assert_eq!(events_a.len(), 1);
        assert_eq!(events_a[0].0, listener.fd());
        assert!(events_a[0].1.is_empty());

        let events_b = sb.drain(b);
        assert_eq!(events_b.len(), 1);
        assert_eq!(events_b[0].0, tp.fd());
    }

    #[test]
    fn datagrams_cross_the_switchboard() {
        let sb = Switchboard::new();
        let a = sb.add_node();
        let b = sb.add_node();

        let mut net_a = MemNet::new(sb.clone(), a);
        let mut net_b = MemNet::new(sb.clone(), b);

        let mut listener = net_a.listen("tcp://10.0.0.1:1").unwrap();
        let mut tp_b = net_b.connect("tcp://10.0.0.1:1").unwrap();
        sb.drain(a);
        sb.drain(b);

        let mut tp_a = listener.accept().unwrap();
        tp_b.send(b"ping").unwrap();
        tp_a.send(b"pong").unwrap();

        let events_a = sb.drain(a);
        assert_eq!(events_a, vec![(tp_a.fd(), Bytes::from_static(b"ping"))]);
        let events_b = sb.drain(b);
        assert_eq!(events_b, vec![(tp_b.fd(), Bytes::from_static(b"pong"))]);
    }

    #[test]
    fn dial_without_listener_fails_asynchronously() {
        let sb = Switchboard::new();
        let a = sb.add_node();
        let mut net_a = MemNet::new(sb.clone(), a);

        let tp = net_a.connect("tcp://10.9.9.9:1").unwrap();
        assert_eq!(tp.state(), TransportState::Closed);
        let events = sb.drain(a);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, tp.fd());
        assert!(events[0].1.is_empty());
    }

    #[test]
    fn closing_one_end_notifies_the_other() {
        let sb = Switchboard::new();
        let a = sb.add_node();
        let b = sb.add_node();

        let mut net_a = MemNet::new(sb.clone(), a);
        let mut net_b = MemNet::new(sb.clone(), b);

        let mut listener = net_a.listen("tcp://10.0.0.1:1").unwrap();
        let mut tp_b = net_b.connect("tcp://10.0.0.1:1").unwrap();
        sb.drain(a);
        sb.drain(b);
        let tp_a = listener.accept().unwrap();

        tp_b.close();
        assert_eq!(tp_a.state(), TransportState::Closed);
        let events_a = sb.drain(a);
        assert_eq!(events_a, vec![(tp_a.fd(), Bytes::new())]);
        assert!(tp_b.send(b"late").is_err());
    }
}
