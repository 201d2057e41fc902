//! Error types for the consensus reactor.

use thiserror::Error;

/// Errors that can occur in the consensus reactor.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// An inbound frame could not be decoded.
    #[error("undecodable message from {peer}: {reason}")]
    Decode { peer: String, reason: String },

    /// An inbound frame exceeded the configured size limit.
    #[error("oversized message from {peer}: {size} bytes (max {max})")]
    Oversized {
        peer: String,
        size: usize,
        max: usize,
    },

    /// The peer is not tracked.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// The peer limit has been reached.
    #[error("maximum peers reached: {0}")]
    MaxPeersReached(usize),

    /// A channel to a peer or to the state machine is gone.
    #[error("channel closed")]
    ChannelClosed,
}

/// Convenience result type for reactor operations.
pub type Result<T> = std::result::Result<T, ReactorError>;
