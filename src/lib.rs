//! Multi-hop TCP-over-WebSocket tunneling overlay.
//!
//! A [`node::Node`] is an overlay vertex: it accepts and dials WebSocket
//! [`link::Link`]s, keeps a pool of named [`peer::Peer`]s, and relays
//! the hop-by-hop [`frame`] protocol between them. `listen_proxy` turns
//! a local TCP listener into the origin of a multi-hop tunnel; the
//! terminal hop dials the real target and the two TCP sides are bridged
//! frame-by-frame through every peer in between.

pub mod config;
pub mod error;
pub mod frame;
pub mod link;
pub mod node;
pub mod peer;
pub mod pubsub;

pub use error::{Result, TunnelError};
pub use node::Node;
pub use peer::Peer;
