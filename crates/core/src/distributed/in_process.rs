//! Thread-backed process group.
//!
//! Runs every rank of an expert-parallel group as a thread of the current
//! process. Ranks share nothing but the collective's rendezvous slots, so the
//! engine code path is the same one used across real processes.

use std::sync::{Arc, Barrier, Mutex, PoisonError};

use candle_core::Tensor;

use super::communicator::{
    from_host_buffer, reduce_rank_ordered, to_host_buffer, DeviceCommunicator, ReduceOp,
};
use super::context::DistributedContext;
use super::error::{DistributedError, Result};
use super::process_group::{LocalProcessGroup, ProcessGroup};

/// One rank's contribution to the collective in flight.
struct Contribution {
    dims: Vec<usize>,
    op: ReduceOp,
    data: Vec<f64>,
}

struct Rendezvous {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Contribution>>>,
}

/// A group of `world_size` thread-backed ranks.
pub struct InProcessGroup {
    world_size: usize,
    rendezvous: Arc<Rendezvous>,
}

impl InProcessGroup {
    /// Create a group of `world_size` ranks.
    pub fn new(world_size: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(DistributedError::EmptyGroup);
        }
        let slots = (0..world_size).map(|_| None).collect();
        Ok(Self {
            world_size,
            rendezvous: Arc::new(Rendezvous {
                barrier: Barrier::new(world_size),
                slots: Mutex::new(slots),
            }),
        })
    }

    /// Number of ranks in the group.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Build the communicator for every rank, in rank order.
    pub fn communicators(&self) -> Vec<InProcessCommunicator> {
        (0..self.world_size)
            .map(|rank| InProcessCommunicator {
                process_group: LocalProcessGroup::with_rank(rank, self.world_size),
                rendezvous: Arc::clone(&self.rendezvous),
            })
            .collect()
    }

    /// Run `worker` once per rank on its own thread and collect the results.
    ///
    /// Each worker receives its rank's [`DistributedContext`]; its return
    /// value comes back through that thread's join handle, so results are
    /// returned in rank order without any shared result store. Once every
    /// rank has returned, a rank that panicked is reported as
    /// [`DistributedError::PeerFailure`]. A rank that panics or returns
    /// without entering a collective the others entered leaves them blocked,
    /// and `run` does not return.
    pub fn run<T, F>(world_size: usize, worker: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(DistributedContext) -> T + Sync,
    {
        let group = Self::new(world_size)?;
        let contexts = group
            .communicators()
            .into_iter()
            .map(|comm| DistributedContext::new(Arc::new(comm)))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(world_size, "starting in-process ranks");

        let worker = &worker;
        std::thread::scope(|scope| {
            let handles: Vec<_> = contexts
                .into_iter()
                .enumerate()
                .map(|(rank, ctx)| {
                    let handle = std::thread::Builder::new()
                        .name(format!("ep-rank-{rank}"))
                        .spawn_scoped(scope, move || worker(ctx))?;
                    Ok(handle)
                })
                .collect::<Result<Vec<_>>>()?;

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle.join().map_err(|_| DistributedError::PeerFailure {
                        rank,
                        reason: "rank thread panicked".to_string(),
                    })
                })
                .collect()
        })
    }
}

/// Communicator handle of one thread-backed rank.
pub struct InProcessCommunicator {
    process_group: LocalProcessGroup,
    rendezvous: Arc<Rendezvous>,
}

impl InProcessCommunicator {
    fn reduce_slots(&self, dims: &[usize], op: ReduceOp) -> Result<Vec<f64>> {
        let slots = self
            .rendezvous
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut buffers = Vec::with_capacity(slots.len());
        for (rank, slot) in slots.iter().enumerate() {
            let contribution = slot.as_ref().ok_or_else(|| DistributedError::PeerFailure {
                rank,
                reason: "missing contribution".to_string(),
            })?;
            if contribution.dims != dims {
                return Err(DistributedError::ShapeMismatch {
                    expected: dims.to_vec(),
                    actual: contribution.dims.clone(),
                });
            }
            if contribution.op != op {
                return Err(DistributedError::PeerFailure {
                    rank,
                    reason: format!("reduce op {:?} does not match {:?}", contribution.op, op),
                });
            }
            buffers.push(contribution.data.as_slice());
        }

        reduce_rank_ordered(op, &buffers)
    }
}

impl DeviceCommunicator for InProcessCommunicator {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
        let dims = tensor.dims().to_vec();
        let data = to_host_buffer(tensor)?;
        let rank = self.process_group.rank();

        {
            let mut slots = self
                .rendezvous
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            slots[rank] = Some(Contribution {
                dims: dims.clone(),
                op,
                data,
            });
        }

        // Every rank has published.
        self.rendezvous.barrier.wait();
        let reduced = self.reduce_slots(&dims, op);
        // Every rank has read; slots may be overwritten by the next collective.
        self.rendezvous.barrier.wait();

        from_host_buffer(reduced?, &dims, tensor.dtype(), tensor.device())
    }

    fn barrier(&self) -> Result<()> {
        self.rendezvous.barrier.wait();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn rejects_empty_group() {
        assert!(matches!(
            InProcessGroup::new(0),
            Err(DistributedError::EmptyGroup)
        ));
    }

    #[test]
    fn communicators_carry_ranks() {
        let group = InProcessGroup::new(3).unwrap();
        let comms = group.communicators();
        assert_eq!(comms.len(), 3);
        for (rank, comm) in comms.iter().enumerate() {
            assert_eq!(comm.process_group().rank(), rank);
            assert_eq!(comm.process_group().world_size(), 3);
        }
    }

    #[test]
    fn all_reduce_sums_across_ranks() {
        let outputs = InProcessGroup::run(4, |mut ctx| {
            let rank = ctx.rank() as f32;
            let t = Tensor::new(&[[rank, 1.0], [2.0 * rank, -1.0]], &Device::Cpu).unwrap();
            let out = ctx.all_reduce_sum(&t).unwrap();
            out.to_vec2::<f32>().unwrap()
        })
        .unwrap();

        // 0 + 1 + 2 + 3 = 6
        for out in outputs {
            assert_eq!(out, vec![vec![6.0, 4.0], vec![12.0, -4.0]]);
        }
    }

    #[test]
    fn all_reduce_keeps_dtype() {
        let outputs = InProcessGroup::run(2, |mut ctx| {
            let t = Tensor::ones((2, 2), DType::F64, &Device::Cpu).unwrap();
            let out = ctx.all_reduce_sum(&t).unwrap();
            (out.dtype(), out.to_vec2::<f64>().unwrap())
        })
        .unwrap();

        for (dtype, values) in outputs {
            assert_eq!(dtype, DType::F64);
            assert_eq!(values, vec![vec![2.0, 2.0], vec![2.0, 2.0]]);
        }
    }

    #[test]
    fn repeated_collectives_do_not_mix() {
        let outputs = InProcessGroup::run(3, |mut ctx| {
            let mut seen = Vec::new();
            for step in 0..5 {
                let t = Tensor::new(&[(ctx.rank() + step) as f32], &Device::Cpu).unwrap();
                let out = ctx.all_reduce_sum(&t).unwrap();
                seen.push(out.to_vec1::<f32>().unwrap()[0]);
            }
            seen
        })
        .unwrap();

        // sum over ranks of (rank + step) = 3 + 3 * step
        for seen in outputs {
            assert_eq!(seen, vec![3.0, 6.0, 9.0, 12.0, 15.0]);
        }
    }

    #[test]
    fn shape_mismatch_fails_on_every_rank() {
        let outputs = InProcessGroup::run(2, |mut ctx| {
            let len = if ctx.rank() == 0 { 2 } else { 3 };
            let t = Tensor::zeros(len, DType::F32, &Device::Cpu).unwrap();
            ctx.all_reduce_sum(&t).is_err()
        })
        .unwrap();

        assert_eq!(outputs, vec![true, true]);
    }

    #[test]
    fn panicking_rank_is_reported() {
        let result = InProcessGroup::run(1, |_ctx| -> usize { panic!("boom") });
        assert!(matches!(
            result,
            Err(DistributedError::PeerFailure { rank: 0, .. })
        ));
    }

    #[test]
    fn rank_panicking_after_collective_is_reported() {
        let result = InProcessGroup::run(2, |mut ctx| {
            let t = Tensor::ones(2, DType::F32, &Device::Cpu).unwrap();
            let out = ctx.all_reduce_sum(&t).unwrap();
            if ctx.rank() == 1 {
                panic!("rank 1 failed after the reduction");
            }
            out.to_vec1::<f32>().unwrap()
        });
        assert!(matches!(
            result,
            Err(DistributedError::PeerFailure { rank: 1, .. })
        ));
    }
}
