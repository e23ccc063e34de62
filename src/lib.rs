// src/lib.rs

pub mod bridge;
pub mod cli;
pub mod config;
pub mod dag;
pub mod effects;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod job;
pub mod logging;
pub mod pipeline;
pub mod runner;
pub mod seed;
pub mod stage;
pub mod status;
pub mod store;
pub mod types;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::loader::{config_root_dir, load_from_path};
use crate::config::ConfigFile;
use crate::engine::{Engine, EngineEvent, EngineSettings, Runtime, RuntimeOptions};
use crate::exec::{LocalDownstream, LoggingDispatcher, RunPlan, spawn_runner};
use crate::runner::{AccessLevel, Runner};
use crate::seed::{seed_pipeline, seed_with_errors};
use crate::status::Status;
use crate::store::MemoryStore;
use crate::types::PipelineId;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - definition loading (an invalid definition still runs, as a pipeline
///   that fails with a config error)
/// - store / engine / runtime
/// - simulated runners and the scheduled-job ticker
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let raw = load_from_path(&config_path)?;
    let validated = ConfigFile::try_from(raw.clone());

    if args.dry_run {
        print_dry_run(&validated?);
        return Ok(());
    }

    let settings = match &validated {
        Ok(cfg) => EngineSettings::from_config(cfg),
        Err(_) => EngineSettings::default(),
    };
    let downstream = LocalDownstream::new(config_root_dir(&config_path), &raw.project, &raw.projects);
    let engine = Arc::new(Engine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(LoggingDispatcher),
        Arc::new(downstream),
        settings,
    ));

    let now = Utc::now();
    let runner_ids: Vec<_> = match &validated {
        Ok(cfg) => runners_from_config(cfg, now)
            .into_iter()
            .map(|runner| engine.register_runner(runner))
            .collect(),
        Err(_) => Vec::new(),
    };

    let git_ref = args
        .git_ref
        .clone()
        .unwrap_or_else(|| raw.project.default_branch.clone());
    let header = engine.new_pipeline_header(&raw.project.path, &git_ref, &args.sha, now);
    let record = match &validated {
        Ok(cfg) => seed_pipeline(cfg, header, now),
        Err(err) => {
            warn!(error = %err, "pipeline definition is invalid");
            seed_with_errors(header, err.to_string())
        }
    };
    let pipeline_id = record.id();

    // Runtime event channel.
    let (rt_tx, rt_rx) = mpsc::channel::<EngineEvent>(raw.engine.event_queue_length.max(1));

    engine.create_pipeline(record).await?;

    if let Ok(cfg) = &validated {
        let plan = Arc::new(RunPlan::from_config(cfg, args.fail.iter().cloned()));
        for runner_id in runner_ids {
            spawn_runner(Arc::clone(&engine), runner_id, rt_tx.clone(), Arc::clone(&plan));
        }
    }

    // Scheduled jobs become due with wall-clock time.
    {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if tx.send(EngineEvent::ScheduledTick { now: Utc::now() }).await.is_err() {
                    break;
                }
            }
        });
    }

    // Ctrl-C → graceful shutdown.
    {
        let tx = rt_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(EngineEvent::ShutdownRequested).await;
        });
    }
    drop(rt_tx);

    let runtime = Runtime::new(
        Arc::clone(&engine),
        rt_rx,
        RuntimeOptions {
            exit_when_idle: true,
        },
    );
    match tokio::time::timeout(Duration::from_secs(args.timeout_secs), runtime.run()).await {
        Ok(result) => result?,
        Err(_) => warn!(timeout_secs = args.timeout_secs, "pipeline did not settle in time"),
    }

    print_summary(&engine, pipeline_id)?;

    let status = engine.pipeline(pipeline_id)?.status();
    if status == Status::Failed {
        anyhow::bail!("pipeline {pipeline_id} failed");
    }
    Ok(())
}

/// Runners from `[runner.<name>]`, or a single runner that takes every job
/// when none are configured.
fn runners_from_config(cfg: &ConfigFile, now: chrono::DateTime<Utc>) -> Vec<Runner> {
    if cfg.runner.is_empty() {
        let tags: BTreeSet<&String> = cfg.job.values().flat_map(|job| job.tags.iter()).collect();
        debug!(?tags, "no runners configured; using a local runner");
        return vec![Runner::new(0, "local-runner", now).with_tags(tags.into_iter().cloned())];
    }

    cfg.runner
        .iter()
        .map(|(name, section)| {
            let mut runner = Runner::new(0, name.clone(), now).with_tags(section.tags.iter().cloned());
            runner.run_untagged = section.effective_run_untagged();
            runner.maximum_timeout_secs = section.maximum_timeout_secs;
            if section.protected {
                runner.access_level = AccessLevel::RefProtected;
            }
            runner
        })
        .collect()
}

/// Simple dry-run output: print stages, jobs and their settings.
fn print_dry_run(cfg: &ConfigFile) {
    println!("pipeline-engine dry-run");
    println!("  project = {}", cfg.project.path);
    println!("  engine.stage_mode = {:?}", cfg.engine.stage_mode);
    println!(
        "  engine.optimistic_lock_attempts = {}",
        cfg.engine.optimistic_lock_attempts
    );
    println!();

    for stage in cfg.stages.iter() {
        let jobs: Vec<_> = cfg.job.iter().filter(|(_, job)| &job.stage == stage).collect();
        if jobs.is_empty() {
            continue;
        }
        println!("stage {stage} ({}):", jobs.len());
        for (name, job) in jobs {
            println!("  - {name}");
            println!("      when: {:?}", job.when);
            if job.allow_failure {
                println!("      allow_failure: true");
            }
            if !job.needs.is_empty() {
                println!("      needs: {:?}", job.needs);
            }
            if !job.tags.is_empty() {
                println!("      tags: {:?}", job.tags);
            }
            if let Some(secs) = job.start_in_secs {
                println!("      start_in_secs: {secs}");
            }
            if let Some(ref trigger) = job.trigger {
                match trigger.project {
                    Some(ref project) => println!("      trigger: project {project}"),
                    None => println!("      trigger: include {:?}", trigger.include),
                }
                if trigger.is_dependent() {
                    println!("      strategy: depend");
                }
            }
        }
    }

    debug!("dry-run complete (no execution)");
}

/// Print the final state of the pipeline and every downstream pipeline.
fn print_summary(engine: &Engine, pipeline_id: PipelineId) -> Result<()> {
    let mode = engine.settings().stage_mode;
    let mut ids = engine.store().pipeline_ids();
    ids.sort_unstable();

    for id in ids {
        let record = engine.pipeline(id)?;
        let pipeline = &record.pipeline;

        let mut title = format!("pipeline #{} ({}) {}", pipeline.id, pipeline.project, pipeline.status);
        if let Some(upstream) = pipeline.upstream {
            title.push_str(&format!(
                " <- pipeline #{} bridge {}",
                upstream.pipeline_id, upstream.bridge_id
            ));
        }
        if let Some(secs) = pipeline.duration {
            title.push_str(&format!(" in {secs}s"));
        }
        title.push_str(&format!(", {} stages", record.stages_count()));
        println!("{title}");

        if let Some(ref errors) = pipeline.yaml_errors {
            println!("  config error: {errors}");
        }
        if engine.is_stuck(id)? {
            println!("  stuck: no online runner can take a pending job");
        }
        for stage in record.ordered_stages(mode) {
            let warning = if stage.has_warnings() { " (with warnings)" } else { "" };
            println!("  stage {}: {}{warning}", stage.name, stage.status);
            for job in record.latest_jobs().filter(|job| job.stage == stage.name) {
                match job.failure_reason {
                    Some(reason) => println!("    {} {} ({reason:?})", job.name, job.status),
                    None => println!("    {} {}", job.name, job.status),
                }
            }
        }
    }

    info!(pipeline_id, "run summary printed");
    Ok(())
}
