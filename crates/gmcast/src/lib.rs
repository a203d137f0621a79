//! GMCast — a group multicast overlay.
//!
//! The controller discovers peers, keeps pairwise TCP connections alive,
//! exchanges topology so every member transitively learns every other
//! member's address, and fans user datagrams out to the whole group. It is
//! the connectivity substrate beneath a view-synchrony membership layer.
//!
//! The crate is sans-IO: socket work happens behind the [`transport::Net`]
//! façade, and an external single-threaded event loop drives
//! [`Gmcast::handle_up`], [`Gmcast::handle_down`] and
//! [`Gmcast::handle_timers`]. See `gmcastd` for a reference loop and
//! [`testing`] for the simulated one.

pub mod addr;
pub mod clock;
pub mod error;
pub mod mesh;
pub mod proto;
pub mod testing;
pub mod transport;
pub mod view;

pub use error::Error;
pub use mesh::{Gmcast, PeerInfo, UserDatagram};
pub use proto::{ProtoEvent, ProtoState};
pub use transport::{Fd, Listener, Net, Transport, TransportState};
pub use view::{View, ViewType};
