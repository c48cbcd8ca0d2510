//! Seeded synthetic expert weights and token batches.
//!
//! Weight maps are keyed by the names [`crate::moe::DispatchEngine`] loads
//! (`experts.{i}.w{1,2,3}`, `shared_experts.w{1,2,3}`), so they can be fed to
//! `VarBuilder::from_tensors` or persisted with [`crate::experiment`].

use std::collections::HashMap;

use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::experiment::{expert_var, shared_var};
use crate::moe::MoeConfig;

/// `[shape]` f32 tensor with entries uniform in `[-bound, bound)`.
pub fn uniform_tensor(
    rng: &mut StdRng,
    shape: (usize, usize),
    bound: f32,
    device: &Device,
) -> Result<Tensor> {
    let data: Vec<f32> = (0..shape.0 * shape.1)
        .map(|_| rng.gen_range(-bound..bound))
        .collect();
    Tensor::from_vec(data, shape, device)
}

fn push_expert(
    map: &mut HashMap<String, Tensor>,
    rng: &mut StdRng,
    names: [String; 3],
    dim: usize,
    inter_dim: usize,
    device: &Device,
) -> Result<()> {
    let [w1, w2, w3] = names;
    let in_bound = 1.0 / (dim as f32).sqrt();
    let out_bound = 1.0 / (inter_dim as f32).sqrt();
    map.insert(w1, uniform_tensor(rng, (inter_dim, dim), in_bound, device)?);
    map.insert(w2, uniform_tensor(rng, (dim, inter_dim), out_bound, device)?);
    map.insert(w3, uniform_tensor(rng, (inter_dim, dim), in_bound, device)?);
    Ok(())
}

/// Seeded weights for every routed expert and the shared expert.
///
/// Entries are uniform in `±1/sqrt(fan_in)`, so activations stay O(1).
pub fn random_weight_map(
    config: &MoeConfig,
    seed: u64,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut map = HashMap::with_capacity(3 * (config.n_routed_experts + 1));

    for expert in 0..config.n_routed_experts {
        let names = ["w1", "w2", "w3"].map(|p| expert_var(expert, p));
        push_expert(
            &mut map,
            &mut rng,
            names,
            config.dim,
            config.moe_inter_dim,
            device,
        )?;
    }
    let names = ["w1", "w2", "w3"].map(shared_var);
    push_expert(
        &mut map,
        &mut rng,
        names,
        config.dim,
        config.shared_inter_dim(),
        device,
    )?;

    Ok(map)
}

/// Seeded `[num_tokens, dim]` batch uniform in `[-1, 1)`.
pub fn random_input(num_tokens: usize, dim: usize, seed: u64, device: &Device) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    uniform_tensor(&mut rng, (num_tokens, dim), 1.0, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::small_moe_config;

    #[test]
    fn weight_map_has_every_projection() {
        let config = small_moe_config();
        let map = random_weight_map(&config, 0, &Device::Cpu).unwrap();
        assert_eq!(map.len(), 3 * 9);
        assert_eq!(map["experts.7.w1"].dims(), &[8, 16]);
        assert_eq!(map["experts.7.w2"].dims(), &[16, 8]);
        assert_eq!(map["shared_experts.w3"].dims(), &[16, 16]);
    }

    #[test]
    fn inputs_are_seeded() {
        let a = random_input(3, 4, 9, &Device::Cpu).unwrap();
        let b = random_input(3, 4, 9, &Device::Cpu).unwrap();
        assert_eq!(a.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());
        let values = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (-1.0..1.0).contains(v)));
    }
}
