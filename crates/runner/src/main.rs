use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use moe_ep_core::moe::ExpertPlacement;
use moe_ep_runner::commands::{self, Backend};
use moe_ep_runner::config::RunnerConfig;
use moe_ep_runner::logging;

#[derive(Parser)]
#[command(name = "moe-ep", about = "Expert-parallel MoE dispatch experiments")]
struct Cli {
    /// TOML config file; CLI arguments take precedence over it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

/// Options shared by every subcommand.
#[derive(Args)]
struct CommonArgs {
    /// Experiment directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

/// Options selecting the expert-parallel group.
#[derive(Args)]
struct GroupArgs {
    /// Number of ranks
    #[arg(long)]
    world_size: Option<usize>,

    /// Expert placement (linear, round-robin)
    #[arg(long)]
    placement: Option<ExpertPlacement>,
}

#[derive(Subcommand)]
enum Command {
    /// Generate routing table, input batch and expert weights
    Generate {
        #[command(flatten)]
        common: CommonArgs,

        /// Model dimension
        #[arg(long)]
        dim: Option<usize>,

        /// Intermediate dimension of one routed expert
        #[arg(long)]
        moe_inter_dim: Option<usize>,

        /// Routed expert pool size
        #[arg(long)]
        n_routed_experts: Option<usize>,

        /// Shared expert width multiplier
        #[arg(long)]
        n_shared_experts: Option<usize>,

        /// Experts selected per token
        #[arg(long)]
        n_activated_experts: Option<usize>,

        /// Tokens in the batch
        #[arg(long)]
        num_tokens: Option<usize>,

        /// RNG seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Run the layer on a generated experiment and write `output`
    Run {
        #[command(flatten)]
        common: CommonArgs,

        #[command(flatten)]
        group: GroupArgs,

        /// Where the ranks live
        #[arg(long, value_enum, default_value_t = Backend::Threads)]
        backend: Backend,
    },

    /// Spawn one process per rank, joined over TCP
    Launch {
        #[command(flatten)]
        common: CommonArgs,

        #[command(flatten)]
        group: GroupArgs,

        /// Rendezvous port of rank 0
        #[arg(long)]
        master_port: Option<u16>,
    },

    /// Compare `output` against a reference
    Check {
        #[command(flatten)]
        common: CommonArgs,

        /// Persisted reference tensor (base path); recomputed densely if omitted
        #[arg(long)]
        reference: Option<PathBuf>,

        /// Relative tolerance
        #[arg(long)]
        rtol: Option<f64>,

        /// Absolute tolerance
        #[arg(long)]
        atol: Option<f64>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.log_level.as_deref() {
        Some(level) => logging::init_with_level(level)?,
        None => logging::init()?,
    }

    let mut cfg = RunnerConfig::load_optional(cli.config.as_deref())?;

    match cli.command {
        Command::Generate {
            common,
            dim,
            moe_inter_dim,
            n_routed_experts,
            n_shared_experts,
            n_activated_experts,
            num_tokens,
            seed,
        } => {
            cfg.merge(&RunnerConfig {
                data_dir: common.data_dir,
                dim,
                moe_inter_dim,
                n_routed_experts,
                n_shared_experts,
                n_activated_experts,
                num_tokens,
                seed,
                ..Default::default()
            });
            commands::generate(&cfg)?;
        }
        Command::Run {
            common,
            group,
            backend,
        } => {
            cfg.merge(&RunnerConfig {
                data_dir: common.data_dir,
                world_size: group.world_size,
                placement: group.placement,
                ..Default::default()
            });
            commands::run(&cfg, backend)?;
        }
        Command::Launch {
            common,
            group,
            master_port,
        } => {
            cfg.merge(&RunnerConfig {
                data_dir: common.data_dir,
                world_size: group.world_size,
                placement: group.placement,
                master_port,
                ..Default::default()
            });
            let program = std::env::current_exe()?;
            commands::launch(&cfg, &program, cli.config.as_deref())?;
        }
        Command::Check {
            common,
            reference,
            rtol,
            atol,
        } => {
            cfg.merge(&RunnerConfig {
                data_dir: common.data_dir,
                rtol,
                atol,
                ..Default::default()
            });
            if !commands::check(&cfg, reference)? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
