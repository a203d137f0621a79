//! Core types for the GMCast group multicast overlay: node identity,
//! wire format, link maps and configuration. This crate performs no I/O.

pub mod config;
pub mod link;
pub mod node;
pub mod wire;

pub use config::GmcastConfig;
pub use link::{Link, LinkMap};
pub use node::NodeId;
