//! Gated linear expert.

use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder};

use super::error::Result;

/// Feed-forward expert with a SiLU-gated linear unit:
/// `down(silu(gate(x)) * up(x))`.
///
/// Used both for routed experts and for the shared expert; they differ only in
/// intermediate width.
#[derive(Debug, Clone)]
pub struct GatedExpert {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl GatedExpert {
    /// Load an expert from `vb`: `w1` (gate, `[inter, dim]`), `w3` (up,
    /// `[inter, dim]`) and `w2` (down, `[dim, inter]`).
    ///
    /// The projections are bare weight tensors named `w1`/`w2`/`w3` directly
    /// under the prefix, not `w1.weight`.
    pub fn new(dim: usize, inter_dim: usize, vb: VarBuilder) -> Result<Self> {
        let gate_proj = Linear::new(vb.get((inter_dim, dim), "w1")?, None);
        let up_proj = Linear::new(vb.get((inter_dim, dim), "w3")?, None);
        let down_proj = Linear::new(vb.get((dim, inter_dim), "w2")?, None);

        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
        })
    }

    /// Apply the expert to `xs` of shape `[..., dim]`.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(xs)?)?;
        let up = self.up_proj.forward(xs)?;
        Ok(self.down_proj.forward(&gate.mul(&up)?)?)
    }

    pub fn dim(&self) -> usize {
        self.down_proj.weight().dims()[0]
    }

    pub fn inter_dim(&self) -> usize {
        self.gate_proj.weight().dims()[0]
    }
}
