//! Shared test utilities for moe-ep-core.
//!
//! Small layer configurations, plus re-exports of the seeded synthesis helpers
//! and the dense reference so tests have one import point.

mod fixtures;

pub use crate::moe::dense_reference;
pub use crate::synth::{random_input, random_weight_map, uniform_tensor};
pub use fixtures::{scenario_b_config, small_moe_config};
