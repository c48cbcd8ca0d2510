//! Distributed context for an expert-parallel rank.
//!
//! [`DistributedContext`] bundles the rank identity with the communicator of
//! its group. It is built once per run, handed to the engine by value, and
//! torn down with [`DistributedContext::shutdown`]; nothing in the engine
//! reads rank or world size from process-global state.

use std::sync::Arc;

use candle_core::Tensor;

use super::communicator::{DeviceCommunicator, LocalCommunicator, ReduceOp};
use super::error::{DistributedError, Result};

/// Runtime context of one expert-parallel rank.
///
/// Not `Clone`; consumed by [`shutdown`][Self::shutdown].
pub struct DistributedContext {
    rank: usize,
    world_size: usize,
    comm: Arc<dyn DeviceCommunicator>,
}

impl DistributedContext {
    /// Create a single-rank context. The reduction step becomes the identity.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            comm: Arc::new(LocalCommunicator::new()),
        }
    }

    /// Create a context from a communicator; rank and world size are taken
    /// from its process group.
    pub fn new(comm: Arc<dyn DeviceCommunicator>) -> Result<Self> {
        let (rank, world_size) = {
            let pg = comm.process_group();
            (pg.rank(), pg.world_size())
        };
        if world_size == 0 {
            return Err(DistributedError::EmptyGroup);
        }
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        Ok(Self {
            rank,
            world_size,
            comm,
        })
    }

    /// This rank's position in the group (0-based).
    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Total number of ranks.
    #[inline]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Returns `true` when this is a single-rank context.
    #[inline]
    pub fn is_single(&self) -> bool {
        self.world_size == 1
    }

    /// Elementwise sum across all ranks. Identity (no collective) for a
    /// single rank.
    ///
    /// Takes `&mut self` so that at most one collective per context is in
    /// flight; ranks then pair their reductions in program order.
    pub fn all_reduce_sum(&mut self, tensor: &Tensor) -> Result<Tensor> {
        if self.is_single() {
            return Ok(tensor.clone());
        }
        self.comm.all_reduce(tensor, ReduceOp::Sum)
    }

    /// Tear the context down: synchronise with the other ranks, then release
    /// the communicator. Consumes the context so it can only happen once.
    pub fn shutdown(self) -> Result<()> {
        if !self.is_single() {
            self.comm.barrier()?;
        }
        tracing::debug!(
            rank = self.rank,
            world_size = self.world_size,
            "distributed context shut down"
        );
        Ok(())
    }
}

impl std::fmt::Debug for DistributedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedContext")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("is_single", &self.is_single())
            .finish()
    }
}
