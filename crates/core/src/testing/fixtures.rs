use crate::moe::MoeConfig;

/// A layer small enough for unit tests: 8 experts of width 8 over 16 features,
/// two activated per token.
pub fn small_moe_config() -> MoeConfig {
    MoeConfig::new(16, 8, 8, 2, 2)
}

/// Full model dimension with 64 experts over 8 ranks, 6 activated per token.
/// The expert width is reduced to keep the weights small.
pub fn scenario_b_config() -> MoeConfig {
    MoeConfig::new(2048, 32, 64, 2, 6)
}
