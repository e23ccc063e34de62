// src/seed.rs

//! Turning a validated definition into a stored pipeline.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::bridge::variables::Variable;
use crate::config::ConfigFile;
use crate::job::Job;
use crate::pipeline::{Pipeline, PipelineRecord};
use crate::stage::Stage;
use crate::types::ConfigSource;

/// Build a pipeline record from `cfg`, using `pipeline` as the header.
///
/// Only stages that have jobs get a row; their position is the index in the
/// definition's `stages` list. Jobs are created in stage order, then by
/// name. Each job's yaml variables are the global `[variables]` followed by
/// its own.
pub fn seed_pipeline(cfg: &ConfigFile, mut pipeline: Pipeline, now: DateTime<Utc>) -> PipelineRecord {
    if cfg.project.auto_devops && pipeline.config_source == ConfigSource::RepositorySource {
        pipeline.config_source = ConfigSource::AutoDevopsSource;
    }
    pipeline.protected_ref = pipeline.protected_ref || cfg.project.is_protected_ref(&pipeline.git_ref);

    pipeline.stages = cfg
        .stages
        .iter()
        .enumerate()
        .filter(|(_, name)| cfg.job.values().any(|job| &job.stage == *name))
        .map(|(idx, name)| Stage::new(name.clone(), idx as u32))
        .collect();

    let mut ordered: Vec<(u32, &String, &crate::config::JobConfig)> = cfg
        .job
        .iter()
        .filter_map(|(name, job)| cfg.stage_index(&job.stage).map(|idx| (idx, name, job)))
        .collect();
    ordered.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    let pipeline_id = pipeline.id;
    let mut record = PipelineRecord::new(pipeline);

    for (stage_idx, name, job_cfg) in ordered {
        let mut job = match &job_cfg.trigger {
            Some(trigger) => Job::bridge(
                0,
                pipeline_id,
                name.clone(),
                job_cfg.stage.clone(),
                stage_idx,
                trigger.clone(),
                now,
            ),
            None => Job::build(0, pipeline_id, name.clone(), job_cfg.stage.clone(), stage_idx, now),
        };
        job.when = job_cfg.when;
        job.allow_failure = job_cfg.allow_failure;
        job.needs = job_cfg.needs.clone();
        job.tags = job_cfg.tags.clone();
        job.start_in_secs = job_cfg.start_in_secs;
        job.timeout_secs = job_cfg.timeout_secs;
        job.yaml_variables = cfg
            .variables
            .iter()
            .chain(job_cfg.variables.iter())
            .map(|(key, value)| Variable::new(key.clone(), value.clone()))
            .collect();

        let id = record.push_job(job);
        debug!(pipeline_id, job_id = id, job = %name, stage = %job_cfg.stage, "job seeded");
    }

    record
}

/// A pipeline whose definition could not be processed. It has no jobs and
/// fails with `config_error` on its first processing pass.
pub fn seed_with_errors(mut pipeline: Pipeline, message: impl Into<String>) -> PipelineRecord {
    pipeline.yaml_errors = Some(message.into());
    PipelineRecord::new(pipeline)
}
