//! Collective communication for expert parallelism.
//!
//! The engine consumes exactly one collective, an elementwise all-reduce, plus
//! a barrier used at teardown. Backends:
//! - [`LocalCommunicator`]: single rank, every collective is the identity.
//! - [`super::InProcessCommunicator`]: ranks are threads of one process.
//! - [`super::TcpCommunicator`]: ranks are OS processes joined over TCP.

use candle_core::{DType, Device, Tensor};

use super::error::{DistributedError, Result};
use super::process_group::{LocalProcessGroup, ProcessGroup};

/// Reduction operations for collective primitives.
///
/// The combine step only ever sums partial outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
}

impl ReduceOp {
    /// Wire tag used by the TCP transport.
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ReduceOp::Sum => 0,
        }
    }

    pub(crate) fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ReduceOp::Sum),
            _ => None,
        }
    }
}

/// Trait for rank-to-rank communication.
///
/// All collectives are blocking: every rank of the group must enter the same
/// collective with a same-shaped tensor, otherwise the call never returns.
pub trait DeviceCommunicator: Send + Sync {
    /// Get the underlying process group.
    fn process_group(&self) -> &dyn ProcessGroup;

    /// All-reduce: apply reduction across all ranks, result on all ranks.
    ///
    /// For a single rank this is the identity.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;

    /// Barrier: synchronize all ranks.
    fn barrier(&self) -> Result<()>;
}

/// Communicator for a single-rank group.
///
/// Every collective is the identity, so the engine pays nothing for the
/// reduction step when `world_size == 1`.
pub struct LocalCommunicator {
    process_group: LocalProcessGroup,
}

impl LocalCommunicator {
    /// Create a communicator for the single-rank group.
    pub fn new() -> Self {
        Self {
            process_group: LocalProcessGroup::new(),
        }
    }
}

impl Default for LocalCommunicator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceCommunicator for LocalCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, _op: ReduceOp) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// Flatten a tensor into an `f64` host buffer for reduction.
///
/// Reductions run in `f64` and are cast back to the caller's dtype, so the
/// summation order across ranks adds no error beyond the final rounding.
pub(crate) fn to_host_buffer(tensor: &Tensor) -> Result<Vec<f64>> {
    Ok(tensor.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?)
}

/// Rebuild a tensor with the given shape, dtype and device from a host buffer.
pub(crate) fn from_host_buffer(
    data: Vec<f64>,
    dims: &[usize],
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let tensor = Tensor::from_vec(data, dims, &Device::Cpu)?;
    Ok(tensor.to_dtype(dtype)?.to_device(device)?)
}

/// Reduce per-rank buffers in rank order.
///
/// `buffers[r]` is rank `r`'s contribution. Every backend funnels through this
/// function so all of them produce bit-identical results for the same inputs.
pub(crate) fn reduce_rank_ordered(op: ReduceOp, buffers: &[&[f64]]) -> Result<Vec<f64>> {
    let Some((first, rest)) = buffers.split_first() else {
        return Err(DistributedError::EmptyGroup);
    };

    let mut acc = first.to_vec();
    for (offset, buffer) in rest.iter().enumerate() {
        if buffer.len() != acc.len() {
            return Err(DistributedError::ShapeMismatch {
                expected: vec![acc.len()],
                actual: vec![buffer.len()],
            });
        }
        let rank = offset + 1;
        tracing::trace!(rank, len = buffer.len(), "folding rank contribution");
        for (a, &b) in acc.iter_mut().zip(buffer.iter()) {
            *a = match op {
                ReduceOp::Sum => *a + b,
            };
        }
    }

    Ok(acc)
}
