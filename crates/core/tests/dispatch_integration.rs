//! Integration tests for expert-parallel dispatch.
//!
//! Every rank runs on a thread of the test process (or over loopback TCP) and
//! the outputs are compared against a dense single-process computation.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use moe_ep_core::distributed::{
    DistributedConfig, DistributedContext, InProcessGroup, TcpCommunicator,
};
use moe_ep_core::experiment::ExperimentDir;
use moe_ep_core::moe::{
    generate, random_distribution, DispatchEngine, ErrorKind, ExpertPlacement, MoeConfig,
    RoutingTable,
};
use moe_ep_core::testing::{
    dense_reference, random_input, random_weight_map, scenario_b_config, small_moe_config,
};
use moe_ep_core::verify::{check_close, check_files, DEFAULT_ATOL};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn build_engine(
    config: &MoeConfig,
    weights: &HashMap<String, Tensor>,
    ctx: DistributedContext,
    placement: ExpertPlacement,
) -> DispatchEngine {
    let vb = VarBuilder::from_tensors(weights.clone(), DType::F32, &Device::Cpu);
    DispatchEngine::new(config.clone(), ctx, placement, vb).unwrap()
}

/// Run the layer on `world_size` thread-backed ranks; returns every rank's
/// output in rank order.
fn run_group(
    config: &MoeConfig,
    weights: &HashMap<String, Tensor>,
    xs: &Tensor,
    table: &RoutingTable,
    world_size: usize,
    placement: ExpertPlacement,
) -> Vec<Tensor> {
    InProcessGroup::run(world_size, |ctx| {
        let mut engine = build_engine(config, weights, ctx, placement);
        let out = engine.forward(xs, table).unwrap();
        engine.shutdown().unwrap();
        out
    })
    .unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

// ─── Partition invariance ────────────────────────────────────────────────────

#[test]
fn output_independent_of_rank_count_and_placement() {
    let config = small_moe_config();
    let weights = random_weight_map(&config, 11, &Device::Cpu).unwrap();
    let xs = random_input(12, config.dim, 12, &Device::Cpu).unwrap();
    let dist = random_distribution(config.n_routed_experts, 13);
    let table = generate(&dist, 12, config.n_activated_experts, 14).unwrap();

    let reference = dense_reference(&config, &weights, &xs, &table).unwrap();

    for placement in [ExpertPlacement::Linear, ExpertPlacement::RoundRobin] {
        for world_size in [1, 2, 4, 8] {
            let outputs = run_group(&config, &weights, &xs, &table, world_size, placement);
            assert_eq!(outputs.len(), world_size);
            for (rank, out) in outputs.iter().enumerate() {
                let diff = max_abs_diff(out, &reference);
                assert!(
                    diff <= 1e-5,
                    "P={world_size} {placement} rank {rank}: max diff {diff}"
                );
            }
        }
    }
}

#[test]
fn single_rank_matches_dense_computation() {
    let config = small_moe_config();
    let weights = random_weight_map(&config, 1, &Device::Cpu).unwrap();
    let xs = random_input(7, config.dim, 2, &Device::Cpu).unwrap();
    let table = generate(&[1.0; 8], 7, 3, 3).unwrap();

    let mut engine = build_engine(
        &config,
        &weights,
        DistributedContext::single(),
        ExpertPlacement::Linear,
    );
    let out = engine.forward(&xs, &table).unwrap();
    let reference = dense_reference(&config, &weights, &xs, &table).unwrap();

    assert!(max_abs_diff(&out, &reference) <= 1e-5);
}

#[test]
fn full_size_eight_ranks_match_single_rank() {
    let config = scenario_b_config();
    let weights = random_weight_map(&config, 2024, &Device::Cpu).unwrap();
    let xs = random_input(10, config.dim, 7, &Device::Cpu).unwrap();
    let dist = random_distribution(config.n_routed_experts, 8);
    let table = generate(&dist, 10, config.n_activated_experts, 9).unwrap();

    let single = run_group(&config, &weights, &xs, &table, 1, ExpertPlacement::Linear);
    let eight = run_group(&config, &weights, &xs, &table, 8, ExpertPlacement::Linear);

    assert_eq!(eight[0].dims(), &[10, 2048]);
    for out in &eight {
        check_close(out, &single[0], 1e-3, DEFAULT_ATOL).unwrap();
    }
}

#[test]
fn consecutive_batches_on_one_engine_stay_separate() {
    let config = small_moe_config();
    let weights = random_weight_map(&config, 41, &Device::Cpu).unwrap();
    let dist = random_distribution(config.n_routed_experts, 42);
    let xa = random_input(5, config.dim, 43, &Device::Cpu).unwrap();
    let xb = random_input(5, config.dim, 44, &Device::Cpu).unwrap();
    let ta = generate(&dist, 5, config.n_activated_experts, 45).unwrap();
    let tb = generate(&dist, 5, config.n_activated_experts, 46).unwrap();
    let ra = dense_reference(&config, &weights, &xa, &ta).unwrap();
    let rb = dense_reference(&config, &weights, &xb, &tb).unwrap();

    let diffs = InProcessGroup::run(2, |ctx| {
        let mut engine = build_engine(&config, &weights, ctx, ExpertPlacement::RoundRobin);
        let mut worst = 0f32;
        for _ in 0..10 {
            let a = engine.forward(&xa, &ta).unwrap();
            let b = engine.forward(&xb, &tb).unwrap();
            worst = worst.max(max_abs_diff(&a, &ra)).max(max_abs_diff(&b, &rb));
        }
        engine.shutdown().unwrap();
        worst
    })
    .unwrap();

    for (rank, diff) in diffs.into_iter().enumerate() {
        assert!(diff <= 1e-5, "rank {rank}: max diff {diff}");
    }
}

// ─── Edge cases ──────────────────────────────────────────────────────────────

#[test]
fn idle_rank_contributes_nothing() {
    let config = small_moe_config();
    let mut weights = random_weight_map(&config, 5, &Device::Cpu).unwrap();
    let xs = random_input(6, config.dim, 6, &Device::Cpu).unwrap();
    // Only experts 0..4 are used, all owned by rank 0 of two.
    let table = generate(&[1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0], 6, 2, 7).unwrap();

    let baseline = run_group(&config, &weights, &xs, &table, 2, ExpertPlacement::Linear);

    let plans = InProcessGroup::run(2, |ctx| {
        let engine = build_engine(&config, &weights, ctx, ExpertPlacement::Linear);
        engine
            .gather_plan(&table)
            .unwrap()
            .iter()
            .all(|list| list.is_empty())
    })
    .unwrap();
    assert_eq!(plans, vec![false, true]);

    // Rank 1's weights never reach the output.
    for id in 4..8 {
        for proj in ["w1", "w2", "w3"] {
            let name = format!("experts.{id}.{proj}");
            let scaled = (weights[&name].clone() * 100.0).unwrap();
            weights.insert(name, scaled);
        }
    }
    let perturbed = run_group(&config, &weights, &xs, &table, 2, ExpertPlacement::Linear);
    assert_eq!(max_abs_diff(&baseline[0], &perturbed[0]), 0.0);
}

#[test]
fn zero_top_k_still_runs_the_collective() {
    let config = small_moe_config();
    let weights = random_weight_map(&config, 3, &Device::Cpu).unwrap();
    let xs = random_input(4, config.dim, 4, &Device::Cpu).unwrap();
    let table = RoutingTable::new(4, 0, vec![], vec![]).unwrap();

    let outputs = run_group(&config, &weights, &xs, &table, 4, ExpertPlacement::Linear);
    let reference = dense_reference(&config, &weights, &xs, &table).unwrap();
    for out in &outputs {
        assert!(max_abs_diff(out, &reference) <= 1e-6);
    }
}

#[test]
fn invalid_ids_fail_on_every_rank_before_the_collective() {
    let config = small_moe_config();
    let weights = random_weight_map(&config, 3, &Device::Cpu).unwrap();
    let xs = random_input(2, config.dim, 4, &Device::Cpu).unwrap();
    let table = RoutingTable::new(2, 2, vec![0, 1, 2, 99], vec![0.5; 4]).unwrap();

    let kinds = InProcessGroup::run(4, |ctx| {
        let mut engine = build_engine(&config, &weights, ctx, ExpertPlacement::RoundRobin);
        engine.forward(&xs, &table).unwrap_err().kind()
    })
    .unwrap();
    assert!(kinds.iter().all(|&k| k == ErrorKind::InvalidAssignment));
}

#[test]
fn indivisible_pool_rejected_at_construction() {
    let config = small_moe_config(); // 8 experts
    let weights = random_weight_map(&config, 0, &Device::Cpu).unwrap();

    let kinds = InProcessGroup::run(3, |ctx| {
        let vb = VarBuilder::from_tensors(weights.clone(), DType::F32, &Device::Cpu);
        DispatchEngine::new(config.clone(), ctx, ExpertPlacement::Linear, vb)
            .unwrap_err()
            .kind()
    })
    .unwrap();
    assert_eq!(kinds, vec![ErrorKind::Configuration; 3]);
}

// ─── Transports and persistence ──────────────────────────────────────────────

#[test]
fn tcp_ranks_match_dense_computation() {
    let config = small_moe_config();
    let weights = Arc::new(random_weight_map(&config, 21, &Device::Cpu).unwrap());
    let xs = random_input(5, config.dim, 22, &Device::Cpu).unwrap();
    let table = generate(&[1.0; 8], 5, 2, 23).unwrap();
    let reference = dense_reference(&config, &weights, &xs, &table).unwrap();

    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let handles: Vec<_> = (0..2)
        .map(|rank| {
            let config = config.clone();
            let weights = Arc::clone(&weights);
            let xs = xs.clone();
            let table = table.clone();
            std::thread::spawn(move || {
                let dist = DistributedConfig {
                    rank,
                    world_size: 2,
                    local_rank: rank,
                    master_addr: "127.0.0.1".to_string(),
                    master_port: port,
                };
                let comm = TcpCommunicator::connect(&dist).unwrap();
                let ctx = DistributedContext::new(Arc::new(comm)).unwrap();
                let mut engine = build_engine(&config, &weights, ctx, ExpertPlacement::Linear);
                let out = engine.forward(&xs, &table).unwrap();
                engine.shutdown().unwrap();
                out
            })
        })
        .collect();

    for handle in handles {
        let out = handle.join().unwrap();
        assert!(max_abs_diff(&out, &reference) <= 1e-5);
    }
}

#[test]
fn persisted_experiment_reproduces_output() {
    let dir = tempfile::tempdir().unwrap();
    let exp = ExperimentDir::new(dir.path());
    let config = small_moe_config();
    let weights = random_weight_map(&config, 31, &Device::Cpu).unwrap();
    let xs = random_input(9, config.dim, 32, &Device::Cpu).unwrap();
    let table = generate(&[2.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.5], 9, 2, 33).unwrap();

    exp.save_config(&config).unwrap();
    exp.save_weights(&config, &weights).unwrap();
    exp.save_input(&xs).unwrap();
    exp.save_routing_table(&table).unwrap();
    exp.save_output(&dense_reference(&config, &weights, &xs, &table).unwrap())
        .unwrap();

    let config = exp.load_config().unwrap();
    let xs = exp.load_input(&Device::Cpu).unwrap();
    let table = exp.load_routing_table().unwrap();
    let outputs = InProcessGroup::run(2, |ctx| {
        let map = moe_ep_core::moe::ExpertMap::new(
            config.n_routed_experts,
            ctx.world_size(),
            ctx.rank(),
            ExpertPlacement::Linear,
        )
        .unwrap();
        let local = exp.load_weights(&config, Some(&map), &Device::Cpu).unwrap();
        let mut engine = build_engine(&config, &local, ctx, ExpertPlacement::Linear);
        engine.forward(&xs, &table).unwrap()
    })
    .unwrap();

    let computed = dir.path().join("computed");
    moe_ep_core::tensor_io::save(&computed, &outputs[0]).unwrap();
    check_files(&computed, exp.output(), 1e-4, 1e-5).unwrap();
}
