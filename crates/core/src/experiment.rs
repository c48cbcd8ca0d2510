//! On-disk layout of a dispatch experiment.
//!
//! All tensors of one experiment live in one directory, each persisted with
//! [`crate::tensor_io`]:
//!
//! ```text
//! <dir>/config.json           MoeConfig
//! <dir>/input.{npy,json}      [T, D] f32 token batch
//! <dir>/indices.{npy,json}    [T, k] i64 expert ids
//! <dir>/scales.{npy,json}     [T, k] f32 routing weights
//! <dir>/output.{npy,json}     [T, D] f32 engine output
//! <dir>/expert_{i}_w{1,2,3}   routed expert weights
//! <dir>/shared_w{1,2,3}       shared expert weights
//! ```

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};

use crate::moe::{ExpertMap, MoeConfig, RoutingTable};
use crate::tensor_io::{self, TensorIoError};

const PROJECTIONS: [&str; 3] = ["w1", "w2", "w3"];

#[derive(thiserror::Error, Debug)]
pub enum ExperimentError {
    #[error(transparent)]
    TensorIo(#[from] TensorIoError),

    #[error("experiment config {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error(transparent)]
    Moe(#[from] crate::moe::MoeError),

    #[error("weight map has no tensor '{0}'")]
    MissingWeight(String),
}

pub type Result<T> = std::result::Result<T, ExperimentError>;

/// Variable name of a routed expert projection, as the engine loads it.
pub fn expert_var(expert: usize, proj: &str) -> String {
    format!("experts.{expert}.{proj}")
}

/// Variable name of a shared expert projection.
pub fn shared_var(proj: &str) -> String {
    format!("shared_experts.{proj}")
}

/// Handle to an experiment directory.
#[derive(Debug, Clone)]
pub struct ExperimentDir {
    root: PathBuf,
}

impl ExperimentDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn indices(&self) -> PathBuf {
        self.root.join("indices")
    }

    pub fn scales(&self) -> PathBuf {
        self.root.join("scales")
    }

    pub fn output(&self) -> PathBuf {
        self.root.join("output")
    }

    fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    fn expert_file(expert: usize, proj: &str) -> String {
        format!("expert_{expert}_{proj}")
    }

    fn shared_file(proj: &str) -> String {
        format!("shared_{proj}")
    }

    pub fn save_config(&self, config: &MoeConfig) -> Result<()> {
        let path = self.config_path();
        let config_err = |reason: String| ExperimentError::Config {
            path: path.clone(),
            reason,
        };
        fs::create_dir_all(&self.root).map_err(|e| config_err(e.to_string()))?;
        let file = File::create(&path).map_err(|e| config_err(e.to_string()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), config)
            .map_err(|e| config_err(e.to_string()))
    }

    pub fn load_config(&self) -> Result<MoeConfig> {
        let path = self.config_path();
        let file = File::open(&path).map_err(|e| ExperimentError::Config {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| ExperimentError::Config {
            path,
            reason: e.to_string(),
        })
    }

    /// Persist every routed and shared expert weight of `weights`.
    pub fn save_weights(
        &self,
        config: &MoeConfig,
        weights: &HashMap<String, Tensor>,
    ) -> Result<()> {
        let get = |var: String| {
            weights
                .get(&var)
                .ok_or(ExperimentError::MissingWeight(var))
        };
        for expert in 0..config.n_routed_experts {
            for proj in PROJECTIONS {
                let tensor = get(expert_var(expert, proj))?;
                tensor_io::save(self.root.join(Self::expert_file(expert, proj)), tensor)?;
            }
        }
        for proj in PROJECTIONS {
            let tensor = get(shared_var(proj))?;
            tensor_io::save(self.root.join(Self::shared_file(proj)), tensor)?;
        }
        Ok(())
    }

    /// Load the weights a rank needs: its own routed experts (every expert
    /// when `owned` is `None`) and the shared expert.
    pub fn load_weights(
        &self,
        config: &MoeConfig,
        owned: Option<&ExpertMap>,
        device: &Device,
    ) -> Result<HashMap<String, Tensor>> {
        let experts: Vec<usize> = match owned {
            Some(map) => map.local_global_ids().collect(),
            None => (0..config.n_routed_experts).collect(),
        };

        let mut names = Vec::with_capacity((experts.len() + 1) * PROJECTIONS.len());
        for &expert in &experts {
            for proj in PROJECTIONS {
                names.push((expert_var(expert, proj), Self::expert_file(expert, proj)));
            }
        }
        for proj in PROJECTIONS {
            names.push((shared_var(proj), Self::shared_file(proj)));
        }

        let map = tensor_io::load_var_map(
            &self.root,
            names.iter().map(|(v, f)| (v.as_str(), f.as_str())),
            device,
        )?;
        tracing::debug!(
            dir = %self.root.display(),
            experts = experts.len(),
            tensors = map.len(),
            "loaded expert weights"
        );
        Ok(map)
    }

    pub fn save_routing_table(&self, table: &RoutingTable) -> Result<()> {
        let (indices, scales) = table.to_tensors(&Device::Cpu)?;
        tensor_io::save(self.indices(), &indices)?;
        tensor_io::save(self.scales(), &scales)?;
        Ok(())
    }

    pub fn load_routing_table(&self) -> Result<RoutingTable> {
        let indices = tensor_io::load(self.indices(), &Device::Cpu)?;
        let scales = tensor_io::load(self.scales(), &Device::Cpu)?;
        Ok(RoutingTable::from_tensors(&indices, &scales)?)
    }

    pub fn save_input(&self, input: &Tensor) -> Result<()> {
        Ok(tensor_io::save(self.input(), input)?)
    }

    pub fn load_input(&self, device: &Device) -> Result<Tensor> {
        Ok(tensor_io::load(self.input(), device)?)
    }

    pub fn save_output(&self, output: &Tensor) -> Result<()> {
        Ok(tensor_io::save(self.output(), output)?)
    }

    pub fn load_output(&self, device: &Device) -> Result<Tensor> {
        Ok(tensor_io::load(self.output(), device)?)
    }
}
