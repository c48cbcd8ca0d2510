//! Process group bootstrap from the environment.
//!
//! # Environment Variables
//!
//! The launcher uses the usual distributed-run environment variables:
//! - `RANK`: Global rank of this process (0..WORLD_SIZE)
//! - `WORLD_SIZE`: Total number of processes
//! - `LOCAL_RANK`: Local rank on this node (for multi-node setups)
//! - `MASTER_ADDR`: Address of rank 0 for coordination (default: 127.0.0.1)
//! - `MASTER_PORT`: Port for coordination (default: 29500)
//!
//! # Usage
//!
//! ```ignore
//! use moe_ep_core::distributed::{init_distributed, DistributedConfig};
//!
//! let config = DistributedConfig::from_env();
//! let ctx = init_distributed(&config)?;
//! // ... run the engine ...
//! ctx.shutdown()?;
//! ```

use std::env;
use std::sync::Arc;

use super::context::DistributedContext;
use super::error::Result;
use super::tcp::TcpCommunicator;

/// Default rendezvous address of rank 0.
pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
/// Default rendezvous port of rank 0.
pub const DEFAULT_MASTER_PORT: u16 = 29500;

/// Distributed configuration from environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedConfig {
    /// Global rank of this process.
    pub rank: usize,
    /// Total number of processes.
    pub world_size: usize,
    /// Local rank on this node.
    pub local_rank: usize,
    /// Master address for coordination.
    pub master_addr: String,
    /// Master port for coordination.
    pub master_port: u16,
}

impl DistributedConfig {
    /// Create from environment variables.
    ///
    /// Falls back to single-process defaults if not set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let rank = lookup("RANK").and_then(|s| s.parse().ok()).unwrap_or(0);

        let world_size = lookup("WORLD_SIZE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let local_rank = lookup("LOCAL_RANK")
            .and_then(|s| s.parse().ok())
            .unwrap_or(rank);

        let master_addr = lookup("MASTER_ADDR").unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string());

        let master_port = lookup("MASTER_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MASTER_PORT);

        Self {
            rank,
            world_size,
            local_rank,
            master_addr,
            master_port,
        }
    }

    /// Configuration of a single-process run.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port: DEFAULT_MASTER_PORT,
        }
    }

    /// Whether more than one process takes part.
    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    /// Environment entries describing this rank, for spawning a worker.
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("RANK", self.rank.to_string()),
            ("WORLD_SIZE", self.world_size.to_string()),
            ("LOCAL_RANK", self.local_rank.to_string()),
            ("MASTER_ADDR", self.master_addr.clone()),
            ("MASTER_PORT", self.master_port.to_string()),
        ]
    }
}

/// Build the [`DistributedContext`] for this process.
///
/// A single-process configuration gets the identity communicator and never
/// opens a socket; otherwise the process joins the TCP group.
pub fn init_distributed(config: &DistributedConfig) -> Result<DistributedContext> {
    if !config.is_distributed() {
        return Ok(DistributedContext::single());
    }
    let comm = TcpCommunicator::connect(config)?;
    DistributedContext::new(Arc::new(comm))
}
