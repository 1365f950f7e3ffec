//! Public error types for the tunnel core.
//!
//! Mirrors the teacher daemon's split between a typed `thiserror` enum at
//! library boundaries and `anyhow::Result` for internal plumbing.

use thiserror::Error;

/// Error returned from the public [`crate::node::Node`] entrypoints.
/// Failures internal to frame dispatch (unknown hop, exhausted link pool)
/// never reach this type — they travel back to the caller as ERROR
/// frames over the tunnel itself, per spec §7.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("hops list must not be empty")]
    EmptyHops,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, TunnelError>;
