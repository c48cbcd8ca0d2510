//! Expert ownership across expert-parallel ranks.
//!
//! The routed expert pool `[0, N)` is split into `P` disjoint slices of
//! `N / P` experts, one per rank. [`partition`] gives the contiguous slice of a
//! rank; [`ExpertMap`] is the full global/local id table for one rank under a
//! chosen [`ExpertPlacement`].
//!
//! ## Placement Strategies
//!
//! - **Linear**: Rank 0 gets experts [0..n/p], Rank 1 gets [n/p..2n/p], etc.
//!   Identical to [`partition`].
//!
//! - **RoundRobin**: Rank 0 gets experts [0, p, 2p, ...], Rank 1 gets
//!   [1, p+1, 2p+1, ...].
//!
//! ## Example
//!
//! ```ignore
//! use moe_ep_core::moe::{ExpertMap, ExpertPlacement};
//!
//! // 8 experts distributed across 2 ranks
//! let map = ExpertMap::new(8, 2, 0, ExpertPlacement::Linear)?;
//! assert!(map.is_local(3));
//! assert!(!map.is_local(4));
//! assert_eq!(map.owner_rank(5), Some(1));
//! ```

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{MoeError, Result};

/// Contiguous slice of the expert pool owned by `rank` out of `world_size`.
///
/// Returns `[rank * N / P, (rank + 1) * N / P)`.
pub fn partition(num_experts: usize, world_size: usize, rank: usize) -> Result<Range<usize>> {
    check_group(num_experts, world_size, rank)?;
    let per_rank = num_experts / world_size;
    Ok(rank * per_rank..(rank + 1) * per_rank)
}

fn check_group(num_experts: usize, world_size: usize, rank: usize) -> Result<()> {
    if world_size == 0 {
        return Err(MoeError::config("world_size must be > 0"));
    }
    if rank >= world_size {
        return Err(MoeError::config(format!(
            "rank ({rank}) must be < world_size ({world_size})"
        )));
    }
    if num_experts % world_size != 0 {
        return Err(MoeError::config(format!(
            "num_experts ({num_experts}) must be divisible by world_size ({world_size})"
        )));
    }
    Ok(())
}

/// Expert placement strategy across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExpertPlacement {
    /// Contiguous blocks: Rank i gets experts [i*n/p .. (i+1)*n/p).
    #[default]
    Linear,
    /// Round-robin: Rank i gets experts [i, i+p, i+2p, ...].
    RoundRobin,
}

impl fmt::Display for ExpertPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpertPlacement::Linear => write!(f, "linear"),
            ExpertPlacement::RoundRobin => write!(f, "round-robin"),
        }
    }
}

impl FromStr for ExpertPlacement {
    type Err = MoeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(ExpertPlacement::Linear),
            "round-robin" | "round_robin" | "roundrobin" => Ok(ExpertPlacement::RoundRobin),
            other => Err(MoeError::config(format!(
                "unknown expert placement '{other}', expected 'linear' or 'round-robin'"
            ))),
        }
    }
}

/// Maps global expert ids to local ids for one rank.
///
/// Global ids are what routing tables carry; local ids index the experts whose
/// weights this rank holds.
#[derive(Debug, Clone)]
pub struct ExpertMap {
    /// `Some(local_id)` if the expert is owned by this rank.
    global_to_local: Vec<Option<usize>>,
    local_to_global: Vec<usize>,
    local_num_experts: usize,
    rank: usize,
    world_size: usize,
    num_experts: usize,
    placement: ExpertPlacement,
}

impl ExpertMap {
    /// Create the map of `rank` in a group of `world_size` ranks.
    ///
    /// Fails if `world_size` is 0, `rank >= world_size`, or `num_experts` is
    /// not divisible by `world_size`.
    pub fn new(
        num_experts: usize,
        world_size: usize,
        rank: usize,
        placement: ExpertPlacement,
    ) -> Result<Self> {
        check_group(num_experts, world_size, rank)?;

        let local_num_experts = num_experts / world_size;
        let local_to_global: Vec<usize> = match placement {
            ExpertPlacement::Linear => partition(num_experts, world_size, rank)?.collect(),
            ExpertPlacement::RoundRobin => (0..local_num_experts)
                .map(|local_id| rank + local_id * world_size)
                .collect(),
        };

        let mut global_to_local = vec![None; num_experts];
        for (local_id, &global_id) in local_to_global.iter().enumerate() {
            global_to_local[global_id] = Some(local_id);
        }

        Ok(Self {
            global_to_local,
            local_to_global,
            local_num_experts,
            rank,
            world_size,
            num_experts,
            placement,
        })
    }

    /// Map of a single-rank group: every expert is local, ids are identical.
    pub fn single(num_experts: usize) -> Self {
        Self {
            global_to_local: (0..num_experts).map(Some).collect(),
            local_to_global: (0..num_experts).collect(),
            local_num_experts: num_experts,
            rank: 0,
            world_size: 1,
            num_experts,
            placement: ExpertPlacement::Linear,
        }
    }

    /// Check if a global expert id is owned by this rank.
    #[inline]
    pub fn is_local(&self, global_id: usize) -> bool {
        self.to_local(global_id).is_some()
    }

    /// Convert a global expert id to a local one, `None` if not owned here.
    #[inline]
    pub fn to_local(&self, global_id: usize) -> Option<usize> {
        self.global_to_local.get(global_id).copied().flatten()
    }

    /// Convert a local expert id to its global id.
    #[inline]
    pub fn to_global(&self, local_id: usize) -> Option<usize> {
        self.local_to_global.get(local_id).copied()
    }

    /// Rank that owns a global expert id, `None` if out of range.
    #[inline]
    pub fn owner_rank(&self, global_id: usize) -> Option<usize> {
        if global_id >= self.num_experts {
            return None;
        }
        Some(match self.placement {
            ExpertPlacement::Linear => global_id / self.local_num_experts,
            ExpertPlacement::RoundRobin => global_id % self.world_size,
        })
    }

    #[inline]
    pub fn local_num_experts(&self) -> usize {
        self.local_num_experts
    }

    #[inline]
    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    #[inline]
    pub fn placement(&self) -> ExpertPlacement {
        self.placement
    }

    /// Iterate over the global ids owned by this rank, in local id order.
    pub fn local_global_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.local_to_global.iter().copied()
    }

    /// Local-to-global mapping as a slice.
    #[inline]
    pub fn local_to_global_map(&self) -> &[usize] {
        &self.local_to_global
    }
}
