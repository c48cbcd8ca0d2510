//! Error types for distributed operations.

use thiserror::Error;

/// Errors that can occur while setting up or running a collective.
///
/// Every variant is fatal for the forward pass that observed it: collectives
/// are never retried.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// A process group must contain at least one rank.
    #[error("world_size must be > 0")]
    EmptyGroup,

    /// Ranks entered the same collective with differently shaped tensors.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A peer rank left the group or violated the wire protocol.
    #[error("peer rank {rank} failed: {reason}")]
    PeerFailure { rank: usize, reason: String },

    /// Bootstrap of the process group failed.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// Socket-level failure on the collective transport.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
