//! Mixture of Experts (MoE) expert-parallel dispatch.
//!
//! ## Submodules
//!
//! - [`routing_table`]: Synthetic per-token expert assignments
//! - [`expert_map`]: Ownership of the expert pool across ranks
//! - [`expert`]: Gated linear expert
//! - [`dispatch`]: Expert-parallel dispatch/combine engine
//!
//! [`dense_reference`] evaluates the same layer token by token on one process.

mod config;
pub mod dispatch;
mod error;
pub mod expert;
pub mod expert_map;
mod reference;
pub mod routing_table;

pub use config::MoeConfig;
pub use dispatch::{DispatchEngine, ExpertSlot, GatherList};
pub use error::{ErrorKind, MoeError, Result};
pub use expert::GatedExpert;
pub use expert_map::{partition, ExpertMap, ExpertPlacement};
pub use reference::dense_reference;
pub use routing_table::{
    empirical_distribution, generate, max_deviation, random_distribution, RoutingTable,
};
