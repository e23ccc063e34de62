// src/dag/mod.rs

//! Pipeline processing.
//!
//! - [`graph`] holds the `needs` graph between the jobs of a pipeline.
//! - [`processor`] contains the pass that decides which jobs can start,
//!   which are skipped and what status the pipeline ends up in.
//! - [`step`] defines the result type for a processing pass.

pub mod graph;
pub mod processor;
pub mod step;

pub use graph::NeedsGraph;
pub use processor::{PipelineProcessor, process_pipeline};
pub use step::ProcessingStep;
