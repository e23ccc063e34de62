// src/pipeline/mod.rs

//! Pipelines and the record the store keeps for each of them.
//!
//! - [`machine`] holds the pipeline state machine and `update_status`.
//! - [`duration`] computes the running time of a pipeline.
//!
//! A [`PipelineRecord`] bundles a pipeline with all its jobs (including
//! retried ones) and the job-id allocator. It is the unit of optimistic
//! locking: every mutation loads a record, changes a copy and writes it back.

pub mod duration;
pub mod machine;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bridge::variables::{Variable, VariableCollection};
use crate::job::machine::{self as job_machine, JobEvent, JobTransition};
use crate::job::Job;
use crate::runner::{BuildMatcher, Runner};
use crate::stage::{self, Stage, StageSummary};
use crate::status::{Status, StatusHolder, composite_of_statuses};
use crate::types::{ConfigSource, JobId, PipelineId, Source, StageMode};

pub use machine::{PipelineEvent, PipelineTransition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineFailureReason {
    UnknownFailure,
    ConfigError,
}

/// The bridge that created a downstream pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamLink {
    pub pipeline_id: PipelineId,
    pub bridge_id: JobId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub id: PipelineId,
    /// Per-project sequence number.
    pub iid: u64,
    pub project: String,
    pub git_ref: String,
    pub tag: bool,
    pub sha: String,
    pub before_sha: Option<String>,
    pub source_sha: Option<String>,
    pub target_sha: Option<String>,
    pub status: Status,
    pub source: Source,
    pub config_source: ConfigSource,
    pub yaml_errors: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub auto_canceled_by: Option<PipelineId>,
    pub failure_reason: Option<PipelineFailureReason>,
    pub merge_request_id: Option<u64>,
    pub protected_ref: bool,
    /// User-supplied pipeline variables.
    pub variables: Vec<Variable>,
    pub stages: Vec<Stage>,
    pub upstream: Option<UpstreamLink>,
}

impl Pipeline {
    pub fn new(
        id: PipelineId,
        project: impl Into<String>,
        git_ref: impl Into<String>,
        sha: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            iid: id,
            project: project.into(),
            git_ref: git_ref.into(),
            tag: false,
            sha: sha.into(),
            before_sha: None,
            source_sha: None,
            target_sha: None,
            status: Status::Created,
            source: Source::default(),
            config_source: ConfigSource::default(),
            yaml_errors: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            duration: None,
            auto_canceled_by: None,
            failure_reason: None,
            merge_request_id: None,
            protected_ref: false,
            variables: Vec::new(),
            stages: Vec::new(),
            upstream: None,
        }
    }

    pub fn has_yaml_errors(&self) -> bool {
        self.yaml_errors.is_some()
    }

    pub fn is_child(&self) -> bool {
        self.source == Source::ParentPipeline && self.upstream.is_some()
    }

    pub fn is_downstream(&self) -> bool {
        self.upstream.is_some()
    }

    pub fn is_auto_devops(&self) -> bool {
        self.config_source == ConfigSource::AutoDevopsSource
    }

    /// Seconds between creation and start. Zero is reported as `None`.
    pub fn queued_duration(&self) -> Option<i64> {
        let started = self.started_at?;
        let seconds = (started - self.created_at).num_seconds();
        (seconds != 0).then_some(seconds)
    }

    /// Variables available once the pipeline exists in the store.
    pub fn persisted_variables(&self) -> VariableCollection {
        let mut vars = VariableCollection::new();
        vars.append("CI_PIPELINE_ID", self.id.to_string());
        vars
    }

    pub fn predefined_variables(&self) -> VariableCollection {
        let mut vars = VariableCollection::new();
        vars.append("CI_PIPELINE_IID", self.iid.to_string())
            .append("CI_PIPELINE_SOURCE", self.source.as_str())
            .append("CI_PROJECT_PATH", self.project.as_str())
            .append("CI_COMMIT_SHA", self.sha.as_str())
            .append("CI_COMMIT_REF_NAME", self.git_ref.as_str())
            .append("CI_COMMIT_REF_PROTECTED", self.protected_ref.to_string());
        if let Some(before) = &self.before_sha {
            vars.append("CI_COMMIT_BEFORE_SHA", before.as_str());
        }
        if self.tag {
            vars.append("CI_COMMIT_TAG", self.git_ref.as_str());
        }
        if self.source == Source::MergeRequestEvent {
            if let Some(sha) = &self.source_sha {
                vars.append("CI_MERGE_REQUEST_SOURCE_BRANCH_SHA", sha.as_str());
            }
            if let Some(sha) = &self.target_sha {
                vars.append("CI_MERGE_REQUEST_TARGET_BRANCH_SHA", sha.as_str());
            }
        }
        vars
    }
}

/// A pipeline plus its jobs, as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRecord {
    pub pipeline: Pipeline,
    pub jobs: Vec<Job>,
    pub next_job_id: JobId,
}

impl PipelineRecord {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            jobs: Vec::new(),
            next_job_id: 1,
        }
    }

    pub fn id(&self) -> PipelineId {
        self.pipeline.id
    }

    pub fn status(&self) -> Status {
        self.pipeline.status
    }

    pub fn allocate_job_id(&mut self) -> JobId {
        let id = self.next_job_id;
        self.next_job_id += 1;
        id
    }

    /// Append a job, assigning it a fresh id. Returns the id.
    pub fn push_job(&mut self, mut job: Job) -> JobId {
        let id = self.allocate_job_id();
        job.id = id;
        job.pipeline_id = self.pipeline.id;
        self.jobs.push(job);
        id
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == id)
    }

    pub fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|job| job.id == id)
    }

    pub fn latest_jobs(&self) -> impl Iterator<Item = &Job> {
        stage::latest(&self.jobs)
    }

    pub fn latest_job_named(&self, name: &str) -> Option<&Job> {
        self.latest_jobs().find(|job| job.name == name)
    }

    /// Aggregate of all latest jobs, stage by stage. Pipelines with config
    /// errors are `failed`; pipelines without jobs are `skipped`.
    pub fn latest_builds_status(&self) -> Status {
        if self.pipeline.has_yaml_errors() {
            return Status::Failed;
        }
        let parts = stage::legacy_stages(&self.jobs)
            .into_iter()
            .map(|stage| crate::status::CompositeStatus {
                status: stage.status,
                warnings: stage.warnings,
            });
        composite_of_statuses(parts)
            .map(|c| c.status)
            .unwrap_or(Status::Skipped)
    }

    pub fn is_cancelable(&self) -> bool {
        self.latest_jobs().any(|job| job.is_cancelable())
    }

    pub fn is_retryable(&self) -> bool {
        self.latest_jobs().any(|job| job.is_retryable())
    }

    pub fn number_of_warnings(&self) -> usize {
        self.latest_jobs().filter(|job| job.failed_but_allowed()).count()
    }

    pub fn has_warnings(&self) -> bool {
        self.number_of_warnings() > 0
    }

    /// Every job ever created in the pipeline, retried ones included.
    pub fn total_size(&self) -> usize {
        self.jobs.len()
    }

    /// Distinct stages across every job, retried ones included.
    pub fn stages_count(&self) -> usize {
        self.jobs
            .iter()
            .map(|job| job.stage.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// A pending build that no online runner can take.
    pub fn is_stuck<'r, I>(&self, runners: I, now: DateTime<Utc>) -> bool
    where
        I: IntoIterator<Item = &'r Runner>,
    {
        let runners: Vec<&Runner> = runners.into_iter().collect();
        self.latest_jobs()
            .filter(|job| job.status == Status::Pending && !job.is_bridge())
            .any(|job| {
                let matcher = BuildMatcher::new(job, self.pipeline.protected_ref);
                !runners
                    .iter()
                    .any(|runner| runner.match_build_if_online(&matcher, now))
            })
    }

    pub fn ordered_stages(&self, mode: StageMode) -> Vec<StageSummary> {
        stage::ordered_stages(&self.pipeline.stages, &self.jobs, self.pipeline.status, mode)
    }

    pub fn stages_names(&self) -> Vec<String> {
        self.pipeline.stages.iter().map(|s| s.name.clone()).collect()
    }

    pub fn legacy_stage(&self, name: &str) -> Option<StageSummary> {
        stage::legacy_stage(&self.jobs, name)
    }

    /// Move every skipped latest job after `stage_idx` back to `created` so
    /// the next processing pass reconsiders it.
    pub fn mark_as_processable_after_stage(
        &mut self,
        stage_idx: u32,
        now: DateTime<Utc>,
    ) -> Vec<JobTransition> {
        self.jobs
            .iter_mut()
            .filter(|job| job.is_latest() && job.stage_idx > stage_idx)
            .filter(|job| job.status == Status::Skipped)
            .filter_map(|job| job_machine::transition(job, JobEvent::Process, now).ok().flatten())
            .collect()
    }

    pub fn recompute_duration(&mut self, now: DateTime<Utc>) {
        if self.pipeline.started_at.is_some() {
            self.pipeline.duration = Some(duration::from_jobs(&self.jobs, now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn record_with(statuses: &[(&str, u32, Status, bool)]) -> PipelineRecord {
        let mut record = PipelineRecord::new(Pipeline::new(1, "group/app", "main", "abc", now()));
        for (name, idx, status, allow) in statuses {
            let mut job = Job::build(0, 1, *name, format!("s{idx}"), *idx, now());
            job.status = *status;
            job.allow_failure = *allow;
            record.push_job(job);
        }
        record
    }

    #[test]
    fn job_ids_are_allocated_sequentially() {
        let record = record_with(&[("a", 0, Status::Created, false), ("b", 0, Status::Created, false)]);
        let ids: Vec<JobId> = record.jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, [1, 2]);
        assert_eq!(record.next_job_id, 3);
    }

    #[test]
    fn stages_count_includes_retried_jobs() {
        let mut record = record_with(&[("a", 0, Status::Success, false), ("b", 1, Status::Success, false)]);
        let mut retried = Job::build(0, 1, "c", "s2", 2, now());
        retried.retried = true;
        record.push_job(retried);
        assert_eq!(record.stages_count(), 3);
    }

    #[test]
    fn pending_builds_without_an_online_runner_are_stuck() {
        let mut record = record_with(&[("a", 0, Status::Pending, false)]);
        record.jobs[0].tags = vec!["docker".into()];

        let mut runner = crate::runner::Runner::new(1, "docker", now()).with_tags(["docker"]);
        assert!(record.is_stuck([&runner], now()));

        runner.heartbeat(Default::default(), now());
        assert!(!record.is_stuck([&runner], now()));

        let mut shell = crate::runner::Runner::new(2, "shell", now()).with_tags(["shell"]);
        shell.heartbeat(Default::default(), now());
        assert!(record.is_stuck([&shell], now()));

        record.jobs[0].status = Status::Running;
        assert!(!record.is_stuck(std::iter::empty(), now()));
    }

    #[test]
    fn yaml_errors_force_failed() {
        let mut record = record_with(&[("a", 0, Status::Success, false)]);
        record.pipeline.yaml_errors = Some("bad".into());
        assert_eq!(record.latest_builds_status(), Status::Failed);
    }

    #[test]
    fn no_jobs_means_skipped() {
        let record = record_with(&[]);
        assert_eq!(record.latest_builds_status(), Status::Skipped);
    }

    #[test]
    fn warnings_count_allowed_failures() {
        let record = record_with(&[
            ("a", 0, Status::Success, false),
            ("b", 0, Status::Failed, true),
        ]);
        assert_eq!(record.latest_builds_status(), Status::Success);
        assert_eq!(record.number_of_warnings(), 1);
        assert!(record.has_warnings());
    }

    #[test]
    fn processable_flush_only_touches_later_skipped_jobs() {
        let mut record = record_with(&[
            ("build", 0, Status::Skipped, false),
            ("test", 1, Status::Failed, false),
            ("deploy", 2, Status::Skipped, false),
            ("notify", 2, Status::Success, false),
        ]);
        let changed = record.mark_as_processable_after_stage(1, now());
        assert_eq!(changed.len(), 1);
        assert_eq!(record.latest_job_named("deploy").unwrap().status, Status::Created);
        assert_eq!(record.latest_job_named("build").unwrap().status, Status::Skipped);
    }

    #[test]
    fn queued_duration_zero_is_none() {
        let mut pipeline = Pipeline::new(1, "p", "main", "abc", now());
        pipeline.started_at = Some(now());
        assert_eq!(pipeline.queued_duration(), None);
        pipeline.started_at = Some(now() + chrono::Duration::seconds(3));
        assert_eq!(pipeline.queued_duration(), Some(3));
    }

    #[test]
    fn predefined_variables_describe_the_commit() {
        let mut pipeline = Pipeline::new(7, "group/app", "v1.0", "abc", now());
        pipeline.tag = true;
        let vars = pipeline.predefined_variables();
        assert_eq!(vars.get("CI_COMMIT_TAG"), Some("v1.0"));
        assert_eq!(vars.get("CI_PIPELINE_SOURCE"), Some("push"));
        assert_eq!(pipeline.persisted_variables().get("CI_PIPELINE_ID"), Some("7"));
    }
}
