//! Dimensions of an expert-parallel MoE layer.

use serde::{Deserialize, Serialize};

use super::error::{MoeError, Result};

/// Sizes of one MoE layer.
///
/// The defaults are those of a DeepSeek-V2-Lite style MoE block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoeConfig {
    /// Model (token feature) dimension `D`.
    pub dim: usize,
    /// Intermediate dimension of one routed expert.
    pub moe_inter_dim: usize,
    /// Size `N` of the routed expert pool.
    pub n_routed_experts: usize,
    /// Width multiplier of the shared expert (`n_shared_experts * moe_inter_dim`).
    pub n_shared_experts: usize,
    /// Experts selected per token (`k`).
    pub n_activated_experts: usize,
}

impl Default for MoeConfig {
    fn default() -> Self {
        Self {
            dim: 2048,
            moe_inter_dim: 1408,
            n_routed_experts: 64,
            n_shared_experts: 2,
            n_activated_experts: 6,
        }
    }
}

impl MoeConfig {
    pub fn new(
        dim: usize,
        moe_inter_dim: usize,
        n_routed_experts: usize,
        n_shared_experts: usize,
        n_activated_experts: usize,
    ) -> Self {
        Self {
            dim,
            moe_inter_dim,
            n_routed_experts,
            n_shared_experts,
            n_activated_experts,
        }
    }

    /// Intermediate width of the shared expert.
    pub fn shared_inter_dim(&self) -> usize {
        self.n_shared_experts * self.moe_inter_dim
    }

    /// Number of routed experts each of `world_size` ranks owns.
    pub fn local_experts(&self, world_size: usize) -> Result<usize> {
        self.validate(world_size)?;
        Ok(self.n_routed_experts / world_size)
    }

    /// Check the sizes against a group of `world_size` ranks.
    pub fn validate(&self, world_size: usize) -> Result<()> {
        if self.dim == 0 || self.moe_inter_dim == 0 {
            return Err(MoeError::config(format!(
                "dim ({}) and moe_inter_dim ({}) must be > 0",
                self.dim, self.moe_inter_dim
            )));
        }
        if self.n_routed_experts == 0 {
            return Err(MoeError::config("n_routed_experts must be > 0"));
        }
        if self.n_shared_experts == 0 {
            return Err(MoeError::config("n_shared_experts must be > 0"));
        }
        if self.n_activated_experts > self.n_routed_experts {
            return Err(MoeError::config(format!(
                "n_activated_experts ({}) exceeds n_routed_experts ({})",
                self.n_activated_experts, self.n_routed_experts
            )));
        }
        if world_size == 0 {
            return Err(MoeError::config("world_size must be > 0"));
        }
        if self.n_routed_experts % world_size != 0 {
            return Err(MoeError::config(format!(
                "n_routed_experts ({}) must be divisible by world_size ({})",
                self.n_routed_experts, world_size
            )));
        }
        Ok(())
    }
}
