//! Error types for the MoE dispatch/combine engine.

use thiserror::Error;

use crate::distributed::DistributedError;

/// Coarse classification of a [`MoeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Inconsistent sizes, ranks or distributions; detected before compute.
    Configuration,
    /// A routing table references an expert id outside the pool, or the same
    /// expert twice for one token.
    InvalidAssignment,
    /// A collective across ranks failed.
    Collective,
    /// A tensor operation failed.
    Tensor,
}

/// Errors raised by the routing table generator, the partitioner and the
/// dispatch engine. None of them is retried.
#[derive(Error, Debug)]
pub enum MoeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("token {token}: expert id {expert} out of range [0, {num_experts})")]
    ExpertOutOfRange {
        token: usize,
        expert: i64,
        num_experts: usize,
    },

    #[error("token {token}: expert {expert} selected more than once")]
    DuplicateExpert { token: usize, expert: usize },

    #[error("collective failed: {0}")]
    Collective(#[from] DistributedError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl MoeError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        MoeError::Configuration(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MoeError::Configuration(_) => ErrorKind::Configuration,
            MoeError::ExpertOutOfRange { .. } | MoeError::DuplicateExpert { .. } => {
                ErrorKind::InvalidAssignment
            }
            MoeError::Collective(_) => ErrorKind::Collective,
            MoeError::Tensor(_) => ErrorKind::Tensor,
        }
    }
}

pub type Result<T> = std::result::Result<T, MoeError>;
