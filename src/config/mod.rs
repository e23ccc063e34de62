// src/config/mod.rs

//! Pipeline definition loading and validation.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a definition from disk (`loader.rs`).
//! - Validate stages, needs and triggers (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path};
pub use model::{
    ConfigFile, DownstreamProjectSection, EngineSection, JobConfig, ProjectSection,
    RawConfigFile, RunnerSection,
};
pub use validate::validate_raw_config;
