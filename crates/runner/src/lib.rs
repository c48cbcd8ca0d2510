//! Experiment runner for the expert-parallel MoE engine.
//!
//! Provides the configuration layer, logging setup, multi-process launcher
//! and subcommand implementations behind the `moe-ep` binary.

pub mod commands;
pub mod config;
pub mod launcher;
pub mod logging;
