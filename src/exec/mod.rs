// src/exec/mod.rs

//! Everything that happens outside the pure engine.
//!
//! - [`backend`] provides the `EffectDispatcher` trait and the
//!   `LoggingDispatcher` the binary uses; tests swap in a recording one.
//! - [`downstream`] creates the pipelines bridges ask for.
//! - [`runner_loop`] simulates runners that pick jobs and report results.

pub mod backend;
pub mod downstream;
pub mod runner_loop;

pub use backend::{EffectDispatcher, LoggingDispatcher};
pub use downstream::{DownstreamService, LocalDownstream};
pub use runner_loop::{RunPlan, spawn_runner};
