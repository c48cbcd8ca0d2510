//! Expert-parallel dispatch and combine.
//!
//! Every rank receives the full token batch and the full routing table, but
//! only evaluates the experts it owns:
//!
//! ```text
//! 1. Validate: shapes and expert ids, before any compute
//! 2. Gather: per local expert, the (token, slot) pairs routed to it
//! 3. Compute: y[token] += w[token][slot] * expert(x[token])
//! 4. Reduce: sum y across ranks (identity for a single rank)
//! 5. Combine: y + shared_expert(x)
//! ```
//!
//! The shared expert is evaluated on every rank over the whole batch and is
//! not part of the reduction. Since ownership partitions the pool, the reduced
//! sum contains each routed contribution exactly once, so the output does not
//! depend on the number of ranks or on the placement.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::config::MoeConfig;
use super::error::{MoeError, Result};
use super::expert::GatedExpert;
use super::expert_map::{ExpertMap, ExpertPlacement};
use super::routing_table::RoutingTable;
use crate::distributed::DistributedContext;

/// Ownership of one global expert id on this rank.
#[derive(Debug)]
pub enum ExpertSlot {
    /// Weights are held here.
    Local(GatedExpert),
    /// Evaluated by rank `owner`.
    Remote { owner: usize },
}

impl ExpertSlot {
    pub fn is_local(&self) -> bool {
        matches!(self, ExpertSlot::Local(_))
    }
}

/// Tokens routed to one local expert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatherList {
    /// Global expert id.
    pub expert: usize,
    /// `(token, slot)` pairs with `indices[token][slot] == expert`, in token
    /// order.
    pub entries: Vec<(usize, usize)>,
}

impl GatherList {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Token rows to gather, as `u32` indices.
    pub fn tokens(&self) -> Vec<u32> {
        self.entries.iter().map(|&(t, _)| t as u32).collect()
    }

    /// Routing weight of each gathered row.
    pub fn weights(&self, table: &RoutingTable) -> Vec<f32> {
        let top_k = table.top_k();
        self.entries
            .iter()
            .map(|&(t, s)| table.weights()[t * top_k + s])
            .collect()
    }
}

/// Expert-parallel MoE layer of one rank.
///
/// Holds weights only for its own slice of the routed pool, plus the shared
/// expert.
pub struct DispatchEngine {
    config: MoeConfig,
    ctx: DistributedContext,
    expert_map: ExpertMap,
    slots: Vec<ExpertSlot>,
    shared: GatedExpert,
}

impl DispatchEngine {
    /// Build the engine for the rank described by `ctx`.
    ///
    /// Loads `experts.{id}.w{1,2,3}` for every locally owned id and
    /// `shared_experts.w{1,2,3}`; weights of remote experts are never read.
    pub fn new(
        config: MoeConfig,
        ctx: DistributedContext,
        placement: ExpertPlacement,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate(ctx.world_size())?;
        let expert_map = ExpertMap::new(
            config.n_routed_experts,
            ctx.world_size(),
            ctx.rank(),
            placement,
        )?;

        let mut slots = Vec::with_capacity(config.n_routed_experts);
        for id in 0..config.n_routed_experts {
            let slot = if expert_map.is_local(id) {
                let vb = vb.pp(format!("experts.{id}"));
                ExpertSlot::Local(GatedExpert::new(config.dim, config.moe_inter_dim, vb)?)
            } else {
                let owner = expert_map
                    .owner_rank(id)
                    .ok_or_else(|| MoeError::config(format!("expert {id} has no owner")))?;
                ExpertSlot::Remote { owner }
            };
            slots.push(slot);
        }

        let shared = GatedExpert::new(
            config.dim,
            config.shared_inter_dim(),
            vb.pp("shared_experts"),
        )?;

        tracing::info!(
            rank = ctx.rank(),
            world_size = ctx.world_size(),
            local_experts = expert_map.local_num_experts(),
            placement = %placement,
            "dispatch engine ready"
        );

        Ok(Self {
            config,
            ctx,
            expert_map,
            slots,
            shared,
        })
    }

    /// Run the layer on `xs` (`[..., dim]`, flattened to `T` rows) routed by
    /// `table` (`T` rows).
    ///
    /// Every rank of the group must call `forward` with the same routing
    /// table and batch shape: the reduction step is a blocking collective.
    /// Calls on one engine are exclusive, so each rank issues its
    /// reductions in the same order.
    pub fn forward(&mut self, xs: &Tensor, table: &RoutingTable) -> Result<Tensor> {
        let orig_shape = xs.dims().to_vec();
        let dim = *orig_shape
            .last()
            .ok_or_else(|| MoeError::config("input must have at least one dimension"))?;
        if dim != self.config.dim {
            return Err(MoeError::config(format!(
                "input feature dim {dim} does not match model dim {}",
                self.config.dim
            )));
        }
        let num_tokens: usize = orig_shape[..orig_shape.len() - 1].iter().product();
        if num_tokens != table.num_tokens() {
            return Err(MoeError::config(format!(
                "input has {num_tokens} tokens but routing table has {}",
                table.num_tokens()
            )));
        }

        let plan = self.gather_plan(table)?;
        let flat = xs.reshape((num_tokens, dim))?;
        let device = xs.device();

        let mut routed = Tensor::zeros((num_tokens, dim), xs.dtype(), device)?;
        for list in &plan {
            if list.is_empty() {
                continue;
            }
            let ExpertSlot::Local(expert) = &self.slots[list.expert] else {
                continue;
            };

            let n = list.len();
            let rows = Tensor::from_vec(list.tokens(), n, device)?;
            let weights = Tensor::from_vec(list.weights(table), (n, 1), device)?
                .to_dtype(xs.dtype())?;

            let out = expert.forward(&flat.index_select(&rows, 0)?)?;
            routed = routed.index_add(&rows, &out.broadcast_mul(&weights)?, 0)?;

            tracing::trace!(expert = list.expert, tokens = n, "local expert applied");
        }

        let shared = self.shared.forward(&flat)?;
        let routed = self.ctx.all_reduce_sum(&routed)?;

        tracing::debug!(
            rank = self.ctx.rank(),
            tokens = num_tokens,
            top_k = table.top_k(),
            active_experts = plan.iter().filter(|l| !l.is_empty()).count(),
            "moe forward"
        );

        Ok(routed.add(&shared)?.reshape(orig_shape)?)
    }

    /// Gather lists of every local expert, in local id order.
    ///
    /// Validates the routing table first; lists may be empty.
    pub fn gather_plan(&self, table: &RoutingTable) -> Result<Vec<GatherList>> {
        table.validate(self.config.n_routed_experts)?;

        let mut lists: Vec<GatherList> = self
            .expert_map
            .local_global_ids()
            .map(|expert| GatherList {
                expert,
                entries: Vec::new(),
            })
            .collect();

        for token in 0..table.num_tokens() {
            let (ids, _) = table.token(token);
            for (slot, &id) in ids.iter().enumerate() {
                if let Some(local) = self.expert_map.to_local(id as usize) {
                    lists[local].entries.push((token, slot));
                }
            }
        }

        Ok(lists)
    }

    pub fn config(&self) -> &MoeConfig {
        &self.config
    }

    pub fn context(&self) -> &DistributedContext {
        &self.ctx
    }

    pub fn expert_map(&self) -> &ExpertMap {
        &self.expert_map
    }

    /// Ownership slot of a global expert id.
    pub fn slot(&self, expert: usize) -> Option<&ExpertSlot> {
        self.slots.get(expert)
    }

    /// Tear down the engine and its distributed context.
    pub fn shutdown(self) -> Result<()> {
        self.ctx.shutdown()?;
        Ok(())
    }
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("config", &self.config)
            .field("ctx", &self.ctx)
            .field("local_experts", &self.expert_map.local_to_global_map())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moe::ErrorKind;
    use crate::distributed::InProcessGroup;
    use crate::testing::{random_input, random_weight_map, small_moe_config};
    use candle_core::{DType, Device};
    use std::sync::Arc;

    fn engine(config: &MoeConfig, seed: u64) -> DispatchEngine {
        let weights = random_weight_map(config, seed, &Device::Cpu).unwrap();
        let vb = VarBuilder::from_tensors(weights, DType::F32, &Device::Cpu);
        DispatchEngine::new(
            config.clone(),
            DistributedContext::single(),
            ExpertPlacement::Linear,
            vb,
        )
        .unwrap()
    }

    #[test]
    fn single_rank_owns_everything() {
        let config = small_moe_config();
        let engine = engine(&config, 0);
        for id in 0..config.n_routed_experts {
            assert!(engine.slot(id).unwrap().is_local());
        }
        assert!(engine.slot(config.n_routed_experts).is_none());
    }

    #[test]
    fn gather_plan_lists_token_slots() {
        let config = small_moe_config(); // 8 experts
        let engine = engine(&config, 0);
        let table =
            RoutingTable::new(3, 2, vec![0, 5, 5, 1, 2, 0], vec![0.5, 0.5, 0.3, 0.7, 0.9, 0.1])
                .unwrap();

        let plan = engine.gather_plan(&table).unwrap();
        assert_eq!(plan.len(), 8);
        assert_eq!(plan[0].entries, vec![(0, 0), (2, 1)]);
        assert_eq!(plan[5].entries, vec![(0, 1), (1, 0)]);
        assert!(plan[3].is_empty());
        assert_eq!(plan[0].weights(&table), vec![0.5, 0.1]);
        assert_eq!(plan[5].tokens(), vec![0, 1]);
    }

    #[test]
    fn out_of_range_id_rejected_before_compute() {
        let config = small_moe_config();
        let mut engine = engine(&config, 0);
        let xs = random_input(2, config.dim, 1, &Device::Cpu).unwrap();
        let table = RoutingTable::new(2, 1, vec![0, 8], vec![1.0, 1.0]).unwrap();

        let err = engine.forward(&xs, &table).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAssignment);
    }

    #[test]
    fn duplicate_id_rejected() {
        let config = small_moe_config();
        let mut engine = engine(&config, 0);
        let xs = random_input(1, config.dim, 1, &Device::Cpu).unwrap();
        let table = RoutingTable::new(1, 2, vec![3, 3], vec![0.5, 0.5]).unwrap();

        assert!(matches!(
            engine.forward(&xs, &table),
            Err(MoeError::DuplicateExpert { token: 0, expert: 3 })
        ));
    }

    #[test]
    fn shape_mismatches_are_configuration_errors() {
        let config = small_moe_config();
        let mut engine = engine(&config, 0);
        let table = RoutingTable::new(2, 1, vec![0, 1], vec![1.0, 1.0]).unwrap();

        let wrong_dim = random_input(2, config.dim + 1, 1, &Device::Cpu).unwrap();
        assert_eq!(
            engine.forward(&wrong_dim, &table).unwrap_err().kind(),
            ErrorKind::Configuration
        );

        let wrong_tokens = random_input(3, config.dim, 1, &Device::Cpu).unwrap();
        assert_eq!(
            engine.forward(&wrong_tokens, &table).unwrap_err().kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn zero_top_k_is_shared_expert_only() {
        let config = small_moe_config();
        let mut engine = engine(&config, 3);
        let xs = random_input(4, config.dim, 2, &Device::Cpu).unwrap();
        let table = RoutingTable::new(4, 0, vec![], vec![]).unwrap();

        let out = engine.forward(&xs, &table).unwrap();
        let shared = engine.shared.forward(&xs).unwrap();
        let diff: f32 = (out - shared)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn leading_batch_dims_are_restored() {
        let config = small_moe_config();
        let mut engine = engine(&config, 1);
        let xs = random_input(6, config.dim, 4, &Device::Cpu)
            .unwrap()
            .reshape((2, 3, config.dim))
            .unwrap();
        let table = crate::moe::generate(&[1.0; 8], 6, 2, 0).unwrap();

        let out = engine.forward(&xs, &table).unwrap();
        assert_eq!(out.dims(), &[2, 3, config.dim]);
    }

    #[test]
    fn missing_local_weights_fail_construction() {
        let config = small_moe_config();
        let mut weights = random_weight_map(&config, 0, &Device::Cpu).unwrap();
        weights.remove("experts.2.w3");
        let vb = VarBuilder::from_tensors(weights, DType::F32, &Device::Cpu);

        let err = DispatchEngine::new(
            config,
            DistributedContext::single(),
            ExpertPlacement::Linear,
            vb,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Tensor);
        assert!(err.to_string().contains("experts.2.w3"), "{err}");
    }

    #[test]
    fn remote_weights_are_never_read() {
        let config = small_moe_config();
        let mut weights = random_weight_map(&config, 0, &Device::Cpu).unwrap();
        for w in ["w1", "w2", "w3"] {
            weights.remove(&format!("experts.2.{w}"));
        }

        for placement in [ExpertPlacement::Linear, ExpertPlacement::RoundRobin] {
            let comm = InProcessGroup::new(2).unwrap().communicators().remove(1);
            let ctx = DistributedContext::new(Arc::new(comm)).unwrap();
            let vb = VarBuilder::from_tensors(weights.clone(), DType::F32, &Device::Cpu);
            let engine = DispatchEngine::new(config.clone(), ctx, placement, vb).unwrap();
            assert!(matches!(
                engine.slot(2),
                Some(ExpertSlot::Remote { owner: 0 })
            ));
        }
    }

    #[test]
    fn shutdown_consumes_engine() {
        let config = small_moe_config();
        engine(&config, 0).shutdown().unwrap();
    }
}
