// tests/runtime_fake_dispatcher.rs

mod common;
use crate::common::builders::{ConfigFileBuilder, JobConfigBuilder};
use crate::common::fakes::memory_engine;
use crate::common::{init_tracing, job_id, record, start, status_of, with_timeout};

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use pipeline_engine::config::ConfigFile;
use pipeline_engine::engine::{EngineEvent, Runtime, RuntimeOptions};
use pipeline_engine::exec::{RunPlan, spawn_runner};
use pipeline_engine::runner::Runner;
use pipeline_engine::status::Status;

type TestResult = Result<(), Box<dyn Error>>;

/// build: compile -> test: unit -> deploy: ship
fn chain_config() -> ConfigFile {
    ConfigFileBuilder::new()
        .with_job("compile", JobConfigBuilder::new("build").build())
        .with_job("unit", JobConfigBuilder::new("test").build())
        .with_job("ship", JobConfigBuilder::new("deploy").build())
        .build()
}

fn quick_plan(failing: &[&str]) -> Arc<RunPlan> {
    Arc::new(RunPlan {
        failing: failing.iter().map(|s| s.to_string()).collect(),
        default_duration: Duration::from_millis(5),
        poll_interval: Duration::from_millis(5),
        ..RunPlan::default()
    })
}

#[tokio::test]
async fn runtime_runs_a_pipeline_to_completion() -> TestResult {
    init_tracing();
    let (engine, dispatcher) = memory_engine();
    let id = start(&engine, &chain_config()).await;
    let runner = engine.register_runner(Runner::new(0, "local", Utc::now()));

    let (tx, rx) = mpsc::channel::<EngineEvent>(16);
    let handle = spawn_runner(Arc::clone(&engine), runner, tx, quick_plan(&[]));

    let runtime = Runtime::new(
        Arc::clone(&engine),
        rx,
        RuntimeOptions {
            exit_when_idle: true,
        },
    );
    with_timeout(runtime.run()).await?;
    with_timeout(handle).await?;

    let rec = record(&engine, id);
    assert_eq!(rec.status(), Status::Success);
    assert!(rec.latest_jobs().all(|job| job.runner_id == Some(runner)));
    assert_eq!(dispatcher.count("pipeline_succeeded"), 1);
    assert!(engine.runner(runner).unwrap().contacted_at.is_some());
    Ok(())
}

#[tokio::test]
async fn failing_job_fails_the_pipeline() -> TestResult {
    init_tracing();
    let (engine, _) = memory_engine();
    let id = start(&engine, &chain_config()).await;
    let runner = engine.register_runner(Runner::new(0, "local", Utc::now()));

    let (tx, rx) = mpsc::channel::<EngineEvent>(16);
    spawn_runner(Arc::clone(&engine), runner, tx, quick_plan(&["unit"]));

    let runtime = Runtime::new(
        Arc::clone(&engine),
        rx,
        RuntimeOptions {
            exit_when_idle: true,
        },
    );
    with_timeout(runtime.run()).await?;

    assert_eq!(record(&engine, id).status(), Status::Failed);
    assert_eq!(status_of(&engine, id, "compile"), Status::Success);
    assert_eq!(status_of(&engine, id, "unit"), Status::Failed);
    assert_eq!(status_of(&engine, id, "ship"), Status::Skipped);
    Ok(())
}

#[tokio::test]
async fn runtime_stops_at_a_manual_job_and_resumes_when_played() -> TestResult {
    init_tracing();
    let cfg = ConfigFileBuilder::new()
        .with_job("compile", JobConfigBuilder::new("build").build())
        .with_job("release", JobConfigBuilder::new("deploy").manual().build())
        .build();
    let (engine, _) = memory_engine();
    let id = start(&engine, &cfg).await;
    let runner = engine.register_runner(Runner::new(0, "local", Utc::now()));

    let (tx, rx) = mpsc::channel::<EngineEvent>(16);
    spawn_runner(Arc::clone(&engine), runner, tx.clone(), quick_plan(&[]));
    let options = RuntimeOptions {
        exit_when_idle: true,
    };
    with_timeout(Runtime::new(Arc::clone(&engine), rx, options).run()).await?;
    assert_eq!(record(&engine, id).status(), Status::Manual);
    drop(tx);

    // Playing unblocks the pipeline; a fresh runtime runs the job.
    engine.play_job(id, job_id(&engine, id, "release")).await?;
    assert_eq!(record(&engine, id).status(), Status::Pending);

    let (tx, rx) = mpsc::channel::<EngineEvent>(16);
    spawn_runner(Arc::clone(&engine), runner, tx, quick_plan(&[]));

    with_timeout(Runtime::new(Arc::clone(&engine), rx, options).run()).await?;
    assert_eq!(status_of(&engine, id, "release"), Status::Success);
    assert_eq!(record(&engine, id).status(), Status::Success);
    Ok(())
}

#[tokio::test]
async fn scheduled_tick_enqueues_due_jobs() -> TestResult {
    init_tracing();
    let cfg = ConfigFileBuilder::new()
        .with_job("rollout", JobConfigBuilder::new("deploy").delayed(600).build())
        .build();
    let (engine, _) = memory_engine();
    let id = start(&engine, &cfg).await;
    assert_eq!(status_of(&engine, id, "rollout"), Status::Scheduled);

    let (tx, rx) = mpsc::channel::<EngineEvent>(16);
    tx.send(EngineEvent::ScheduledTick {
        now: Utc::now() + chrono::Duration::minutes(11),
    })
    .await?;
    tx.send(EngineEvent::ShutdownRequested).await?;

    let runtime = Runtime::new(
        Arc::clone(&engine),
        rx,
        RuntimeOptions {
            exit_when_idle: false,
        },
    );
    with_timeout(runtime.run()).await?;

    assert_eq!(status_of(&engine, id, "rollout"), Status::Pending);
    Ok(())
}

#[tokio::test]
async fn shutdown_stops_an_unsettled_runtime() -> TestResult {
    init_tracing();
    let (engine, _) = memory_engine();
    let id = start(&engine, &chain_config()).await;

    let (tx, rx) = mpsc::channel::<EngineEvent>(16);
    tx.send(EngineEvent::ShutdownRequested).await?;

    let runtime = Runtime::new(
        Arc::clone(&engine),
        rx,
        RuntimeOptions {
            exit_when_idle: true,
        },
    );
    with_timeout(runtime.run()).await?;

    assert!(!engine.is_settled());
    assert_eq!(record(&engine, id).status(), Status::Pending);
    Ok(())
}

#[tokio::test]
async fn bad_reports_do_not_stop_the_runtime() -> TestResult {
    init_tracing();
    let (engine, _) = memory_engine();
    let id = start(&engine, &chain_config()).await;
    let compile = job_id(&engine, id, "compile");

    let (tx, rx) = mpsc::channel::<EngineEvent>(16);
    // A job that does not exist, then a valid report.
    tx.send(EngineEvent::JobUpdated {
        pipeline_id: id,
        job_id: 999,
        status: Status::Running,
        failure_reason: None,
    })
    .await?;
    tx.send(EngineEvent::JobUpdated {
        pipeline_id: id,
        job_id: compile,
        status: Status::Running,
        failure_reason: None,
    })
    .await?;
    drop(tx);

    let runtime = Runtime::new(
        Arc::clone(&engine),
        rx,
        RuntimeOptions {
            exit_when_idle: true,
        },
    );
    with_timeout(runtime.run()).await?;

    assert_eq!(status_of(&engine, id, "compile"), Status::Running);
    Ok(())
}

#[tokio::test]
async fn pending_jobs_are_stuck_until_a_matching_runner_is_online() -> TestResult {
    init_tracing();
    let cfg = ConfigFileBuilder::new()
        .with_job("compile", JobConfigBuilder::new("build").tag("docker").build())
        .build();
    let (engine, _) = memory_engine();
    let id = start(&engine, &cfg).await;
    assert!(engine.is_stuck(id)?);

    let shell = engine.register_runner(Runner::new(0, "shell", Utc::now()).with_tags(["shell"]));
    engine.heartbeat(shell, Default::default())?;
    assert!(engine.is_stuck(id)?);

    let docker = engine.register_runner(Runner::new(0, "docker", Utc::now()).with_tags(["docker"]));
    assert!(engine.is_stuck(id)?, "a runner that never checked in is not online");
    engine.heartbeat(docker, Default::default())?;
    assert!(!engine.is_stuck(id)?);
    Ok(())
}
