//! The stream transport façade the mesh controller consumes.
//!
//! GMCast itself performs no socket I/O. An implementation of [`Net`] hands
//! the controller listener and connection handles; the surrounding event
//! loop reads from the wire and feeds complete datagrams back through
//! `Gmcast::handle_up`, keyed by the transport's fd. A zero-length datagram
//! is the transport's way of reporting a state change (connected, or
//! closed) rather than data.
//!
//! All calls must be non-blocking: `connect` starts a connection attempt
//! and returns a handle that may still be in [`TransportState::Connecting`],
//! `accept` returns whatever the backlog holds, `send` either queues the
//! datagram or fails.

use std::io;

/// Transport identifier, the peer-table key. Implementations hand out
/// unique values per live transport (a socket fd, or a synthetic counter).
pub type Fd = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Closed,
}

/// One bidirectional datagram stream to a peer.
pub trait Transport {
    fn fd(&self) -> Fd;
    fn state(&self) -> TransportState;

    /// Queue one datagram for delivery. Datagram boundaries are preserved
    /// by the transport (length-prefix framing on stream sockets).
    fn send(&mut self, dg: &[u8]) -> io::Result<()>;

    fn close(&mut self);
}

/// A bound listening socket.
pub trait Listener {
    fn fd(&self) -> Fd;

    /// Take one connection off the backlog. Returns `WouldBlock`-style
    /// errors when none is ready; the controller logs and moves on.
    fn accept(&mut self) -> io::Result<Box<dyn Transport>>;

    fn close(&mut self);
}

/// Factory for listeners and outbound connections, addressed by canonical
/// `tcp://ip:port` strings.
pub trait Net {
    fn listen(&mut self, addr: &str) -> io::Result<Box<dyn Listener>>;
    fn connect(&mut self, addr: &str) -> io::Result<Box<dyn Transport>>;
}
