//! Subcommand implementations.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use moe_ep_core::distributed::{
    init_distributed, DistributedConfig, DistributedContext, InProcessGroup,
};
use moe_ep_core::experiment::ExperimentDir;
use moe_ep_core::moe::{
    dense_reference, empirical_distribution, generate as generate_table, max_deviation,
    random_distribution, DispatchEngine, ExpertMap, ExpertPlacement, MoeConfig,
};
use moe_ep_core::synth::{random_input, random_weight_map};
use moe_ep_core::verify::{self, VerifyError};

use crate::config::RunnerConfig;
use crate::launcher;

/// How the ranks of `run` are hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// Every rank is a thread of this process.
    Threads,
    /// This process is one rank; the group comes from the environment.
    Tcp,
}

/// Synthesize an experiment: routing distribution, routing table, token batch
/// and expert weights, all derived from the configured seed.
pub fn generate(config: &RunnerConfig) -> anyhow::Result<ExperimentDir> {
    let moe = config.moe_config();
    moe.validate(1)?;
    let exp = ExperimentDir::new(config.data_dir());
    let seed = config.seed();
    let num_tokens = config.num_tokens();

    let dist = random_distribution(moe.n_routed_experts, seed);
    let table = generate_table(
        &dist,
        num_tokens,
        moe.n_activated_experts,
        seed.wrapping_add(1),
    )?;
    let xs = random_input(num_tokens, moe.dim, seed.wrapping_add(2), &Device::Cpu)?;
    let weights = random_weight_map(&moe, seed.wrapping_add(3), &Device::Cpu)?;

    exp.save_config(&moe)?;
    exp.save_weights(&moe, &weights)?;
    exp.save_input(&xs)?;
    exp.save_routing_table(&table)?;

    let observed = empirical_distribution(&table, moe.n_routed_experts);
    tracing::info!(
        dir = %exp.root().display(),
        num_tokens,
        num_experts = moe.n_routed_experts,
        top_k = moe.n_activated_experts,
        max_deviation = max_deviation(&observed, &dist),
        "experiment generated"
    );
    Ok(exp)
}

/// Evaluate the layer of one rank and return its output.
fn run_rank(
    exp: &ExperimentDir,
    moe: &MoeConfig,
    placement: ExpertPlacement,
    ctx: DistributedContext,
) -> anyhow::Result<Tensor> {
    let rank = ctx.rank();
    let map = ExpertMap::new(moe.n_routed_experts, ctx.world_size(), rank, placement)?;
    let weights = exp
        .load_weights(moe, Some(&map), &Device::Cpu)
        .with_context(|| format!("rank {rank}: loading weights"))?;
    let xs = exp.load_input(&Device::Cpu)?;
    let table = exp.load_routing_table()?;

    let vb = VarBuilder::from_tensors(weights, DType::F32, &Device::Cpu);
    let mut engine = DispatchEngine::new(moe.clone(), ctx, placement, vb)?;
    let out = engine
        .forward(&xs, &table)
        .with_context(|| format!("rank {rank}: forward"))?;
    engine.shutdown()?;
    Ok(out)
}

/// Run the engine on a generated experiment. Rank 0 writes `output`.
pub fn run(config: &RunnerConfig, backend: Backend) -> anyhow::Result<()> {
    let exp = ExperimentDir::new(config.data_dir());
    let moe = exp.load_config()?;
    let placement = config.placement();

    match backend {
        Backend::Threads => {
            let world_size = config.world_size();
            let outputs =
                InProcessGroup::run(world_size, |ctx| run_rank(&exp, &moe, placement, ctx))?;
            let mut outputs = outputs.into_iter();
            let out = outputs
                .next()
                .context("process group returned no ranks")??;
            for (offset, result) in outputs.enumerate() {
                result.with_context(|| format!("rank {} failed", offset + 1))?;
            }
            exp.save_output(&out)?;
            tracing::info!(world_size, %placement, "output written by rank 0");
        }
        Backend::Tcp => {
            let dist = DistributedConfig::from_env();
            let ctx = init_distributed(&dist)?;
            let rank = ctx.rank();
            let out = run_rank(&exp, &moe, placement, ctx)?;
            if rank == 0 {
                exp.save_output(&out)?;
                tracing::info!(
                    world_size = dist.world_size,
                    %placement,
                    "output written by rank 0"
                );
            }
        }
    }
    Ok(())
}

/// Run every rank as its own process via `current_exe run --backend tcp`.
pub fn launch(
    config: &RunnerConfig,
    program: &Path,
    config_file: Option<&Path>,
) -> anyhow::Result<()> {
    let mut args: Vec<OsString> = vec![
        "run".into(),
        "--backend".into(),
        "tcp".into(),
        "--data-dir".into(),
        config.data_dir().into_os_string(),
        "--placement".into(),
        config.placement().to_string().into(),
    ];
    if let Some(path) = config_file {
        args.push("--config".into());
        args.push(path.as_os_str().to_owned());
    }

    let workers =
        launcher::spawn_workers(program, &args, config.world_size(), config.master_port())?;
    let failed = launcher::wait_for_workers(workers);
    anyhow::ensure!(failed.is_empty(), "ranks {failed:?} failed");
    Ok(())
}

/// Compare `output` against `reference` (a persisted tensor base path), or
/// against a dense recomputation of the experiment when no reference is given.
pub fn check(config: &RunnerConfig, reference: Option<PathBuf>) -> anyhow::Result<bool> {
    let exp = ExperimentDir::new(config.data_dir());
    let (rtol, atol) = (config.rtol(), config.atol());

    let result = match reference {
        Some(base) => verify::check_files(exp.output(), base, rtol, atol),
        None => {
            let moe = exp.load_config()?;
            let weights = exp.load_weights(&moe, None, &Device::Cpu)?;
            let xs = exp.load_input(&Device::Cpu)?;
            let table = exp.load_routing_table()?;
            let expected = dense_reference(&moe, &weights, &xs, &table)?;
            let computed = exp.load_output(&Device::Cpu)?;
            verify::check_close(&computed, &expected, rtol, atol)
        }
    };

    match result {
        Ok(()) => {
            tracing::info!(rtol, atol, "output matches reference");
            Ok(true)
        }
        Err(VerifyError::Mismatch(report)) => {
            tracing::error!(
                mismatches = report.entries.len(),
                max_residual = report.max_residual(),
                "output differs from reference"
            );
            eprint!("{report}");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small(dir: &Path) -> RunnerConfig {
        RunnerConfig {
            data_dir: Some(dir.to_path_buf()),
            dim: Some(16),
            moe_inter_dim: Some(8),
            n_routed_experts: Some(8),
            n_shared_experts: Some(1),
            n_activated_experts: Some(3),
            num_tokens: Some(6),
            seed: Some(4),
            ..Default::default()
        }
    }

    #[test]
    fn generate_run_check_with_threads() {
        let dir = tempdir().unwrap();
        let mut config = small(dir.path());

        let exp = generate(&config).unwrap();
        assert!(exp.input().with_extension("npy").exists());
        assert!(dir.path().join("expert_7_w3.npy").exists());

        config.world_size = Some(4);
        config.placement = Some(ExpertPlacement::RoundRobin);
        run(&config, Backend::Threads).unwrap();
        assert!(dir.path().join("output.npy").exists());

        assert!(check(&config, None).unwrap());
    }

    #[test]
    fn check_flags_a_corrupted_output() {
        let dir = tempdir().unwrap();
        let config = small(dir.path());
        let exp = generate(&config).unwrap();
        run(&config, Backend::Threads).unwrap();

        let out = exp.load_output(&Device::Cpu).unwrap();
        exp.save_output(&(out + 1.0).unwrap()).unwrap();
        assert!(!check(&config, None).unwrap());
    }

    #[test]
    fn check_against_reference_file() {
        let dir = tempdir().unwrap();
        let config = small(dir.path());
        let exp = generate(&config).unwrap();
        run(&config, Backend::Threads).unwrap();

        let reference = dir.path().join("copy");
        let out = exp.load_output(&Device::Cpu).unwrap();
        moe_ep_core::tensor_io::save(&reference, &out).unwrap();
        assert!(check(&config, Some(reference)).unwrap());
    }

    #[test]
    fn run_rejects_indivisible_group() {
        let dir = tempdir().unwrap();
        let mut config = small(dir.path());
        generate(&config).unwrap();
        config.world_size = Some(3);
        assert!(run(&config, Backend::Threads).is_err());
    }

    #[test]
    fn run_without_experiment_fails() {
        let dir = tempdir().unwrap();
        let config = small(&dir.path().join("missing"));
        assert!(run(&config, Backend::Threads).is_err());
    }
}
