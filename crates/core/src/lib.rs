//! Expert-parallel Mixture-of-Experts dispatch/combine.
//!
//! - [`moe`]: routing tables, expert ownership, gated experts and the
//!   dispatch engine
//! - [`distributed`]: process groups and the all-reduce collective
//! - [`tensor_io`], [`experiment`]: persisted tensors and experiment layout
//! - [`verify`]: tolerance-based comparison against a reference
//! - [`synth`]: seeded synthetic weights and token batches

pub mod distributed;
pub mod experiment;
pub mod moe;
pub mod synth;
pub mod tensor_io;
pub mod verify;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
