#![allow(dead_code)]

pub use pipeline_engine_test_utils::{builders, fakes, fixed_now, init_tracing, with_timeout};

use pipeline_engine::config::ConfigFile;
use pipeline_engine::engine::Engine;
use pipeline_engine::pipeline::PipelineRecord;
use pipeline_engine::seed::seed_pipeline;
use pipeline_engine::status::Status;
use pipeline_engine::types::{JobId, PipelineId};

/// Seed `cfg` into the engine's store on `main` and run the first
/// processing pass.
pub async fn start(engine: &Engine, cfg: &ConfigFile) -> PipelineId {
    start_on(engine, cfg, "main").await
}

pub async fn start_on(engine: &Engine, cfg: &ConfigFile, git_ref: &str) -> PipelineId {
    let header = engine.new_pipeline_header(&cfg.project.path, git_ref, "abc123", fixed_now());
    let record = seed_pipeline(cfg, header, fixed_now());
    let id = record.id();
    engine
        .create_pipeline(record)
        .await
        .expect("pipeline should be created");
    id
}

pub fn record(engine: &Engine, id: PipelineId) -> PipelineRecord {
    engine.pipeline(id).expect("pipeline should exist")
}

pub fn job_id(engine: &Engine, pipeline: PipelineId, name: &str) -> JobId {
    record(engine, pipeline)
        .latest_job_named(name)
        .unwrap_or_else(|| panic!("no job named {name}"))
        .id
}

pub fn status_of(engine: &Engine, pipeline: PipelineId, name: &str) -> Status {
    record(engine, pipeline)
        .latest_job_named(name)
        .unwrap_or_else(|| panic!("no job named {name}"))
        .status
}

/// Report `status` for the latest job called `name`.
pub async fn report(engine: &Engine, pipeline: PipelineId, name: &str, status: Status) {
    let job = job_id(engine, pipeline, name);
    engine
        .update_job(pipeline, job, status, None)
        .await
        .unwrap_or_else(|err| panic!("reporting {status} for {name} failed: {err}"));
}

/// Run then finish a pending job.
pub async fn run_to(engine: &Engine, pipeline: PipelineId, name: &str, status: Status) {
    report(engine, pipeline, name, Status::Running).await;
    report(engine, pipeline, name, status).await;
}
