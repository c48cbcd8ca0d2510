//! Runner configuration.
//!
//! Configuration is resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (`--config path.toml`)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use moe_ep_core::moe::{ExpertPlacement, MoeConfig};
use serde::{Deserialize, Serialize};

/// Default number of tokens in a generated batch.
pub const DEFAULT_NUM_TOKENS: usize = 10;
/// Default RNG seed.
pub const DEFAULT_SEED: u64 = 0;
/// Default relative tolerance of `check`.
pub const DEFAULT_RTOL: f64 = 1e-3;

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Experiment directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Model dimension.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dim: Option<usize>,

    /// Intermediate dimension of one routed expert.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moe_inter_dim: Option<usize>,

    /// Routed expert pool size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_routed_experts: Option<usize>,

    /// Shared expert width multiplier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_shared_experts: Option<usize>,

    /// Experts selected per token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_activated_experts: Option<usize>,

    /// Tokens in a generated batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_tokens: Option<usize>,

    /// RNG seed for generated data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Number of expert-parallel ranks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_size: Option<usize>,

    /// Expert placement (linear, round-robin).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement: Option<ExpertPlacement>,

    /// Relative tolerance of `check`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtol: Option<f64>,

    /// Absolute tolerance of `check`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atol: Option<f64>,

    /// Rendezvous port of rank 0 for multi-process runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_port: Option<u16>,
}

impl RunnerConfig {
    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Load config from `path` if given, defaults otherwise.
    pub fn load_optional(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load_from(p),
            None => Ok(Self::default()),
        }
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }

        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Overlay every field set in `other` onto `self`.
    pub fn merge(&mut self, other: &RunnerConfig) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field.clone();
                })*
            };
        }
        take!(
            data_dir,
            dim,
            moe_inter_dim,
            n_routed_experts,
            n_shared_experts,
            n_activated_experts,
            num_tokens,
            seed,
            world_size,
            placement,
            rtol,
            atol,
            master_port,
        );
    }

    /// Layer dimensions, falling back to [`MoeConfig::default`] per field.
    pub fn moe_config(&self) -> MoeConfig {
        let d = MoeConfig::default();
        MoeConfig::new(
            self.dim.unwrap_or(d.dim),
            self.moe_inter_dim.unwrap_or(d.moe_inter_dim),
            self.n_routed_experts.unwrap_or(d.n_routed_experts),
            self.n_shared_experts.unwrap_or(d.n_shared_experts),
            self.n_activated_experts.unwrap_or(d.n_activated_experts),
        )
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("moe-ep-data"))
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens.unwrap_or(DEFAULT_NUM_TOKENS)
    }

    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or(DEFAULT_SEED)
    }

    pub fn world_size(&self) -> usize {
        self.world_size.unwrap_or(1)
    }

    pub fn placement(&self) -> ExpertPlacement {
        self.placement.unwrap_or_default()
    }

    pub fn rtol(&self) -> f64 {
        self.rtol.unwrap_or(DEFAULT_RTOL)
    }

    pub fn atol(&self) -> f64 {
        self.atol.unwrap_or(moe_ep_core::verify::DEFAULT_ATOL)
    }

    pub fn master_port(&self) -> u16 {
        self.master_port
            .unwrap_or(moe_ep_core::distributed::DEFAULT_MASTER_PORT)
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
