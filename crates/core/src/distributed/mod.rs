//! Distributed runtime for expert parallelism.
//!
//! This module provides the pieces an expert-parallel rank needs:
//! - [`ProcessGroup`] - Process group membership (ranks, world size)
//! - [`DeviceCommunicator`] - Collective operations (all_reduce, barrier)
//! - [`DistributedContext`] - Per-rank context handed to the engine
//!
//! # Architecture
//!
//! - Single rank: every collective is the identity (world_size=1 bypass)
//! - Threads: [`InProcessGroup`] runs each rank on a thread of this process
//! - Processes: [`TcpCommunicator`] joins ranks through rank 0
//!
//! # Usage
//!
//! ```ignore
//! use moe_ep_core::distributed::InProcessGroup;
//!
//! let sums = InProcessGroup::run(4, |mut ctx| {
//!     let device = candle_core::Device::Cpu;
//!     let t = candle_core::Tensor::ones(2, candle_core::DType::F32, &device)?;
//!     ctx.all_reduce_sum(&t)
//! })?;
//! ```

mod communicator;
mod context;
mod error;
mod in_process;
mod launcher;
mod process_group;
mod tcp;

pub use communicator::{DeviceCommunicator, LocalCommunicator, ReduceOp};
pub use context::DistributedContext;
pub use error::{DistributedError, Result};
pub use in_process::{InProcessCommunicator, InProcessGroup};
pub use launcher::{
    init_distributed, DistributedConfig, DEFAULT_MASTER_ADDR, DEFAULT_MASTER_PORT,
};
pub use process_group::{LocalProcessGroup, ProcessGroup};
pub use tcp::{TcpCommunicator, TcpProcessGroup};
