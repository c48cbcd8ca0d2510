//! Multi-process launcher.
//!
//! `moe-ep launch` spawns one process per rank, each a re-execution of the
//! current binary running `run --backend tcp`, distinguished by the standard
//! distributed environment variables:
//!
//! | Variable      | Set by launcher | Consumed by |
//! |---------------|-----------------|-------------|
//! | `RANK`        | 0..N-1          | `DistributedConfig::from_env()` |
//! | `WORLD_SIZE`  | N               | `DistributedConfig::from_env()` |
//! | `LOCAL_RANK`  | 0..N-1          | `DistributedConfig::from_env()` |
//! | `MASTER_ADDR` | 127.0.0.1       | TCP rendezvous |
//! | `MASTER_PORT` | configured      | TCP rendezvous |

use std::ffi::OsString;
use std::path::Path;
use std::process::{Child, Command};

use moe_ep_core::distributed::{DistributedConfig, DEFAULT_MASTER_ADDR};

/// Environment of every rank of a single-node group.
pub fn rank_configs(world_size: usize, master_port: u16) -> Vec<DistributedConfig> {
    (0..world_size)
        .map(|rank| DistributedConfig {
            rank,
            world_size,
            // Single node: LOCAL_RANK == RANK.
            local_rank: rank,
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port,
        })
        .collect()
}

/// Spawn one worker process per rank running `program args..`.
///
/// Returns the children in rank order.
pub fn spawn_workers(
    program: &Path,
    args: &[OsString],
    world_size: usize,
    master_port: u16,
) -> anyhow::Result<Vec<Child>> {
    anyhow::ensure!(world_size > 0, "world_size must be > 0");

    let mut workers = Vec::with_capacity(world_size);
    for config in rank_configs(world_size, master_port) {
        tracing::info!(
            rank = config.rank,
            world_size,
            master_port,
            "spawning worker"
        );

        let child = Command::new(program)
            .args(args)
            .envs(config.to_env())
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn worker rank {}: {e}", config.rank))?;
        workers.push(child);
    }

    tracing::info!(count = world_size, "all workers spawned");
    Ok(workers)
}

/// Wait for every worker and return the ranks that did not exit cleanly.
pub fn wait_for_workers(mut workers: Vec<Child>) -> Vec<usize> {
    let mut failed = Vec::new();
    for (rank, child) in workers.iter_mut().enumerate() {
        match child.wait() {
            Ok(status) if status.success() => {
                tracing::debug!(rank, "worker exited cleanly");
            }
            Ok(status) => {
                tracing::warn!(rank, ?status, "worker exited with non-zero status");
                failed.push(rank);
            }
            Err(e) => {
                tracing::warn!(rank, error = %e, "error waiting for worker");
                failed.push(rank);
            }
        }
    }
    failed
}
