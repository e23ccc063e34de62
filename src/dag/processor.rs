// src/dag/processor.rs

//! The processing pass run after every change to a pipeline.
//!
//! It walks the latest `created` jobs in needs/stage order, decides for
//! each whether it can start, must be skipped or has to keep waiting,
//! refreshes the persisted stages and finally recomputes the pipeline
//! status. Statuses change in memory as the walk proceeds, so a job that is
//! skipped early is already seen as skipped by the jobs after it.

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::dag::graph::NeedsGraph;
use crate::dag::step::ProcessingStep;
use crate::job::machine::{self as job_machine, JobEvent, JobTransition};
use crate::job::{Job, When};
use crate::pipeline::PipelineRecord;
use crate::pipeline::machine::update_status;
use crate::stage;
use crate::status::{Status, composite};

/// Runs one processing pass over a pipeline record.
pub struct PipelineProcessor<'a> {
    record: &'a mut PipelineRecord,
    now: DateTime<Utc>,
}

impl<'a> PipelineProcessor<'a> {
    pub fn new(record: &'a mut PipelineRecord, now: DateTime<Utc>) -> Self {
        Self { record, now }
    }

    pub fn process(mut self) -> ProcessingStep {
        let mut step = ProcessingStep::default();

        if self.record.pipeline.has_yaml_errors() {
            debug!(
                pipeline_id = self.record.id(),
                "pipeline has config errors; not processing jobs"
            );
        } else {
            step.job_transitions = self.update_processables();
        }

        step.stage_changes =
            stage::refresh_persisted(&mut self.record.pipeline.stages, &self.record.jobs);

        if let Some(transition) = update_status(self.record, self.now) {
            step.pipeline_finished = transition.finished();
            step.pipeline_transition = Some(transition);
        }

        step
    }

    fn update_processables(&mut self) -> Vec<JobTransition> {
        let ordered = NeedsGraph::from_jobs(self.record.latest_jobs()).processing_order();
        let order = match ordered {
            Ok(order) => order,
            Err(err) => {
                // A cyclic record cannot make progress; fail it as a config error.
                error!(pipeline_id = self.record.id(), error = %err, "cannot order jobs");
                self.record.pipeline.yaml_errors = Some(err.to_string());
                return Vec::new();
            }
        };
        let mut transitions = Vec::new();

        for name in order {
            let Some(idx) = self
                .record
                .jobs
                .iter()
                .position(|job| job.is_latest() && job.name == name)
            else {
                continue;
            };

            let job = &self.record.jobs[idx];
            if job.status != Status::Created {
                continue;
            }

            let prior = if job.needs.is_empty() {
                status_for_prior_stages(&self.record.jobs, job.stage_idx)
            } else {
                status_for_needs(&self.record.jobs, &job.needs)
            };

            let Some(event) = processing_event(job, prior) else {
                debug!(job = %job.name, %prior, "job keeps waiting");
                continue;
            };

            match job_machine::transition(&mut self.record.jobs[idx], event, self.now) {
                Ok(Some(transition)) => transitions.push(transition),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "processing transition rejected"),
            }
        }

        transitions
    }
}

/// Process a pipeline record once.
pub fn process_pipeline(record: &mut PipelineRecord, now: DateTime<Utc>) -> ProcessingStep {
    PipelineProcessor::new(record, now).process()
}

/// Aggregate of every latest job in an earlier stage. A job in the first
/// stage sees `success`.
pub fn status_for_prior_stages(jobs: &[Job], stage_idx: u32) -> Status {
    let prior: Vec<&Job> = stage::latest(jobs)
        .filter(|job| job.stage_idx < stage_idx)
        .collect();
    composite(prior.iter().copied())
        .map(|c| c.status)
        .unwrap_or(Status::Success)
}

/// Aggregate of the latest jobs named in `needs`.
pub fn status_for_needs(jobs: &[Job], needs: &[String]) -> Status {
    let needed: Vec<&Job> = stage::latest(jobs)
        .filter(|job| needs.contains(&job.name))
        .collect();
    composite(needed.iter().copied())
        .map(|c| c.status)
        .unwrap_or(Status::Success)
}

/// What to do with a `created` job given the status of what it waits for.
/// `None` means it keeps waiting.
pub fn processing_event(job: &Job, prior: Status) -> Option<JobEvent> {
    if prior.is_blocked() || !prior.is_completed() {
        return None;
    }

    if !job.when.valid_prior_statuses().contains(&prior) {
        return Some(JobEvent::Skip);
    }

    Some(match job.when {
        When::Manual => JobEvent::Actionize,
        When::Delayed if job.is_schedulable() => JobEvent::Schedule,
        When::OnSuccess | When::OnFailure | When::Always | When::Delayed => JobEvent::Enqueue,
    })
}
