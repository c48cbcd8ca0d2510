//! Synthetic routing tables.
//!
//! A [`RoutingTable`] holds, for every token, the `k` experts it is dispatched
//! to and the weight each expert's output is scaled by. [`generate`] draws
//! tables whose per-expert selection frequency follows a target distribution,
//! so dispatch can be exercised under skewed expert load without a trained
//! gate.
//!
//! ## Sampling scheme
//!
//! Experts are chosen per token by systematic sampling proportional to size:
//! expert `i` gets inclusion probability `pi_i = min(1, c * p_i)` with `c`
//! chosen so that `sum(pi) == k`. Laying the `pi_i` end to end on a line (in a
//! fresh random order per token) and reading off the experts under the points
//! `u, u + 1, .., u + k - 1` for `u ~ U[0, 1)` selects exactly `k` distinct
//! experts, and expert `i` is selected with probability `pi_i`. Unless some
//! expert is capped at 1, the expected share of selections is exactly `p_i`.

use std::collections::HashSet;

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::error::{MoeError, Result};

/// Per-token expert ids and routing weights, row-major `[num_tokens, top_k]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingTable {
    num_tokens: usize,
    top_k: usize,
    indices: Vec<i64>,
    weights: Vec<f32>,
}

impl RoutingTable {
    /// Build a table from row-major ids and weights.
    pub fn new(
        num_tokens: usize,
        top_k: usize,
        indices: Vec<i64>,
        weights: Vec<f32>,
    ) -> Result<Self> {
        let expected = num_tokens * top_k;
        if indices.len() != expected || weights.len() != expected {
            return Err(MoeError::config(format!(
                "routing table of {num_tokens}x{top_k} needs {expected} entries, \
                 got {} ids and {} weights",
                indices.len(),
                weights.len()
            )));
        }
        Ok(Self {
            num_tokens,
            top_k,
            indices,
            weights,
        })
    }

    /// Build a table from an id tensor and a weight tensor, both `[T, k]`.
    ///
    /// Ids may be any integer dtype; weights any float dtype.
    pub fn from_tensors(indices: &Tensor, weights: &Tensor) -> Result<Self> {
        let (num_tokens, top_k) = indices.dims2()?;
        if weights.dims() != indices.dims() {
            return Err(MoeError::config(format!(
                "routing ids {:?} and weights {:?} differ in shape",
                indices.dims(),
                weights.dims()
            )));
        }
        let ids = indices
            .to_dtype(DType::I64)?
            .flatten_all()?
            .to_vec1::<i64>()?;
        let scales = weights
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Self::new(num_tokens, top_k, ids, scales)
    }

    /// Ids as an `I64` tensor and weights as an `F32` tensor, both `[T, k]`.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let shape = (self.num_tokens, self.top_k);
        let indices = Tensor::from_vec(self.indices.clone(), shape, device)?;
        let weights = Tensor::from_vec(self.weights.clone(), shape, device)?;
        Ok((indices, weights))
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// All ids, row-major.
    pub fn indices(&self) -> &[i64] {
        &self.indices
    }

    /// All weights, row-major.
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    /// Ids and weights of one token.
    pub fn token(&self, token: usize) -> (&[i64], &[f32]) {
        let start = token * self.top_k;
        let end = start + self.top_k;
        (&self.indices[start..end], &self.weights[start..end])
    }

    /// Check every id lies in `[0, num_experts)` and no token repeats an id.
    pub fn validate(&self, num_experts: usize) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.top_k);
        for token in 0..self.num_tokens {
            seen.clear();
            let (ids, _) = self.token(token);
            for &id in ids {
                if id < 0 || id as usize >= num_experts {
                    return Err(MoeError::ExpertOutOfRange {
                        token,
                        expert: id,
                        num_experts,
                    });
                }
                if !seen.insert(id) {
                    return Err(MoeError::DuplicateExpert {
                        token,
                        expert: id as usize,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Draw a routing table for `num_tokens` tokens with `top_k` experts each.
///
/// Expert selection follows `distribution` (normalised internally); routing
/// weights are independent of it: `top_k` uniform draws in `(0, 1]` scaled to
/// sum to one. The same seed always yields the same table.
pub fn generate(
    distribution: &[f64],
    num_tokens: usize,
    top_k: usize,
    seed: u64,
) -> Result<RoutingTable> {
    let inclusion = inclusion_probabilities(distribution, top_k)?;
    let num_experts = distribution.len();
    let mut rng = StdRng::seed_from_u64(seed);

    let mut indices = Vec::with_capacity(num_tokens * top_k);
    let mut weights = Vec::with_capacity(num_tokens * top_k);
    let mut order: Vec<usize> = (0..num_experts).collect();
    let mut selected = Vec::with_capacity(top_k);

    for _ in 0..num_tokens {
        order.shuffle(&mut rng);
        select_systematic(&inclusion, &order, top_k, rng.gen::<f64>(), &mut selected);
        indices.extend(selected.iter().map(|&e| e as i64));

        let draws: Vec<f32> = (0..top_k).map(|_| 1.0 - rng.gen::<f32>()).collect();
        let total: f64 = draws.iter().map(|&d| d as f64).sum();
        weights.extend(draws.iter().map(|&d| (d as f64 / total) as f32));
    }

    tracing::debug!(num_tokens, top_k, num_experts, seed, "generated routing table");

    RoutingTable::new(num_tokens, top_k, indices, weights)
}

/// A random expert distribution over `num_experts` experts: uniform draws
/// normalised to sum to one.
pub fn random_distribution(num_experts: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let draws: Vec<f64> = (0..num_experts).map(|_| 1.0 - rng.gen::<f64>()).collect();
    let total: f64 = draws.iter().sum();
    draws.into_iter().map(|d| d / total).collect()
}

/// Observed share of selections per expert (bincount over all ids / total).
///
/// Ids outside `[0, num_experts)` are ignored.
pub fn empirical_distribution(table: &RoutingTable, num_experts: usize) -> Vec<f64> {
    let mut counts = vec![0usize; num_experts];
    for &id in table.indices() {
        if id >= 0 && (id as usize) < num_experts {
            counts[id as usize] += 1;
        }
    }
    let total = table.indices().len();
    if total == 0 {
        return vec![0.0; num_experts];
    }
    counts
        .into_iter()
        .map(|c| c as f64 / total as f64)
        .collect()
}

/// Largest absolute elementwise difference between two distributions.
pub fn max_deviation(observed: &[f64], expected: &[f64]) -> f64 {
    observed
        .iter()
        .zip(expected)
        .map(|(o, e)| (o - e).abs())
        .fold(0.0, f64::max)
}

/// Per-expert inclusion probabilities `min(1, c * p_i)` summing to `top_k`.
fn inclusion_probabilities(distribution: &[f64], top_k: usize) -> Result<Vec<f64>> {
    let num_experts = distribution.len();
    if num_experts == 0 {
        return Err(MoeError::config("expert distribution is empty"));
    }
    if top_k > num_experts {
        return Err(MoeError::config(format!(
            "cannot select {top_k} distinct experts out of {num_experts}"
        )));
    }
    if let Some(bad) = distribution.iter().find(|p| !p.is_finite() || **p < 0.0) {
        return Err(MoeError::config(format!(
            "expert distribution has invalid entry {bad}"
        )));
    }
    let total: f64 = distribution.iter().sum();
    if total <= 0.0 {
        return Err(MoeError::config("expert distribution sums to zero"));
    }
    let positive = distribution.iter().filter(|&&p| p > 0.0).count();
    if positive < top_k {
        return Err(MoeError::config(format!(
            "only {positive} experts have non-zero probability, {top_k} required per token"
        )));
    }

    let probs: Vec<f64> = distribution.iter().map(|p| p / total).collect();
    let mut inclusion = vec![0.0; num_experts];
    let mut capped = vec![false; num_experts];

    // Cap experts whose share alone would exceed one selection per token and
    // spread the remaining selections over the rest, until nothing new caps.
    loop {
        let remaining = top_k - capped.iter().filter(|&&c| c).count();
        let free_mass: f64 = probs
            .iter()
            .zip(&capped)
            .filter(|&(_, &c)| !c)
            .map(|(p, _)| p)
            .sum();

        let mut newly_capped = false;
        for i in 0..num_experts {
            if capped[i] {
                continue;
            }
            let pi = if free_mass > 0.0 {
                remaining as f64 * probs[i] / free_mass
            } else {
                0.0
            };
            if pi >= 1.0 {
                capped[i] = true;
                inclusion[i] = 1.0;
                newly_capped = true;
            } else {
                inclusion[i] = pi;
            }
        }
        if !newly_capped {
            break;
        }
    }

    Ok(inclusion)
}

/// Select `top_k` distinct experts with the systematic scheme, walking the
/// experts in `order` from offset `u`.
fn select_systematic(
    inclusion: &[f64],
    order: &[usize],
    top_k: usize,
    u: f64,
    selected: &mut Vec<usize>,
) {
    selected.clear();
    if top_k == 0 {
        return;
    }

    let mut cumulative = 0.0;
    let mut next_point = u;
    for &expert in order {
        cumulative += inclusion[expert];
        if next_point < cumulative {
            selected.push(expert);
            next_point += 1.0;
            if selected.len() == top_k {
                return;
            }
        }
    }

    // Rounding in the running sum can leave the last point just past the end.
    while selected.len() < top_k {
        let fallback = order
            .iter()
            .copied()
            .filter(|e| !selected.contains(e))
            .max_by(|&a, &b| inclusion[a].total_cmp(&inclusion[b]));
        match fallback {
            Some(expert) => selected.push(expert),
            None => break,
        }
    }
}
