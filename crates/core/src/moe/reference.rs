//! Dense single-process computation of the MoE layer.

use std::collections::HashMap;

use candle_core::{DType, IndexOp, Tensor};
use candle_nn::VarBuilder;

use super::config::MoeConfig;
use super::error::Result;
use super::expert::GatedExpert;
use super::routing_table::RoutingTable;

/// Dense single-process computation of the layer, token by token:
/// `shared(x[t]) + sum_s w[t][s] * expert_{idx[t][s]}(x[t])`.
///
/// Uses no gather lists and no reduction, so it serves as ground truth for
/// the dispatch engine.
pub fn dense_reference(
    config: &MoeConfig,
    weights: &HashMap<String, Tensor>,
    xs: &Tensor,
    table: &RoutingTable,
) -> Result<Tensor> {
    table.validate(config.n_routed_experts)?;
    let device = xs.device();
    let vb = VarBuilder::from_tensors(weights.clone(), DType::F32, device);

    let experts = (0..config.n_routed_experts)
        .map(|id| {
            GatedExpert::new(
                config.dim,
                config.moe_inter_dim,
                vb.pp(format!("experts.{id}")),
            )
        })
        .collect::<Result<Vec<_>>>()?;
    let shared = GatedExpert::new(config.dim, config.shared_inter_dim(), vb.pp("shared_experts"))?;

    let mut rows = Vec::with_capacity(table.num_tokens());
    for token in 0..table.num_tokens() {
        let x = xs.i(token..token + 1)?;
        let mut row = shared.forward(&x)?;
        let (ids, scales) = table.token(token);
        for (&id, &w) in ids.iter().zip(scales) {
            let out = experts[id as usize].forward(&x)?;
            row = (row + (out * w as f64)?)?;
        }
        rows.push(row);
    }

    if rows.is_empty() {
        return Ok(Tensor::zeros((0, config.dim), xs.dtype(), device)?);
    }
    Ok(Tensor::cat(&rows, 0)?)
}
