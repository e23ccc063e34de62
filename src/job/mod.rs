// src/job/mod.rs

//! Jobs: builds that runners execute and bridges that trigger other
//! pipelines.
//!
//! - [`machine`] holds the per-job state machine.

pub mod machine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bridge::TriggerConfig;
use crate::bridge::variables::Variable;
use crate::status::{Status, StatusHolder};
use crate::types::{JobId, PipelineId, RunnerId};

pub use machine::{JobEvent, JobTransition};

/// When a job runs relative to the outcome of the stages before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum When {
    OnSuccess,
    OnFailure,
    Always,
    Manual,
    Delayed,
}

impl Default for When {
    fn default() -> Self {
        When::OnSuccess
    }
}

impl When {
    /// Prior statuses under which a job with this `when` is started.
    /// Anything else skips it.
    pub fn valid_prior_statuses(self) -> &'static [Status] {
        match self {
            When::OnSuccess | When::Manual | When::Delayed => &[Status::Success, Status::Skipped],
            When::OnFailure => &[Status::Failed],
            When::Always => &[Status::Success, Status::Failed, Status::Skipped],
        }
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UnknownFailure,
    ScriptFailure,
    ApiFailure,
    StuckOrTimeoutFailure,
    RunnerSystemFailure,
    MissingDependencyFailure,
    JobExecutionTimeout,
    DownstreamBridgeProjectNotFound,
    InsufficientBridgePermissions,
    InvalidBridgeTrigger,
    DownstreamPipelineCreationFailed,
    DownstreamPipelineFailed,
}

impl Default for FailureReason {
    fn default() -> Self {
        FailureReason::UnknownFailure
    }
}

/// Stage jobs wait for every earlier stage; DAG jobs only for their `needs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingType {
    Stage,
    Dag,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    Build,
    Bridge {
        trigger: TriggerConfig,
        /// Set once the downstream pipeline has been created.
        downstream_pipeline_id: Option<PipelineId>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub pipeline_id: PipelineId,
    pub name: String,
    pub stage: String,
    pub stage_idx: u32,
    pub status: Status,
    pub when: When,
    pub allow_failure: bool,
    /// Delay before a `delayed` job is enqueued, in seconds.
    pub start_in_secs: Option<u64>,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Names of jobs this one waits for. Non-empty makes it a DAG job.
    pub needs: Vec<String>,
    pub tags: Vec<String>,
    pub timeout_secs: Option<u64>,
    pub yaml_variables: Vec<Variable>,
    pub kind: JobKind,
    /// Superseded by a retry; no longer part of aggregation.
    pub retried: bool,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<FailureReason>,
    pub runner_id: Option<RunnerId>,
    pub auto_canceled_by: Option<PipelineId>,
}

impl Job {
    /// A build in `created` with default settings.
    pub fn build(
        id: JobId,
        pipeline_id: PipelineId,
        name: impl Into<String>,
        stage: impl Into<String>,
        stage_idx: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            pipeline_id,
            name: name.into(),
            stage: stage.into(),
            stage_idx,
            status: Status::Created,
            when: When::OnSuccess,
            allow_failure: false,
            start_in_secs: None,
            scheduled_at: None,
            needs: Vec::new(),
            tags: Vec::new(),
            timeout_secs: None,
            yaml_variables: Vec::new(),
            kind: JobKind::Build,
            retried: false,
            retry_count: 0,
            created_at: now,
            queued_at: None,
            started_at: None,
            finished_at: None,
            failure_reason: None,
            runner_id: None,
            auto_canceled_by: None,
        }
    }

    /// A bridge in `created` with the given trigger configuration.
    pub fn bridge(
        id: JobId,
        pipeline_id: PipelineId,
        name: impl Into<String>,
        stage: impl Into<String>,
        stage_idx: u32,
        trigger: TriggerConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: JobKind::Bridge {
                trigger,
                downstream_pipeline_id: None,
            },
            ..Self::build(id, pipeline_id, name, stage, stage_idx, now)
        }
    }

    pub fn is_bridge(&self) -> bool {
        matches!(self.kind, JobKind::Bridge { .. })
    }

    pub fn trigger(&self) -> Option<&TriggerConfig> {
        match &self.kind {
            JobKind::Bridge { trigger, .. } => Some(trigger),
            JobKind::Build => None,
        }
    }

    pub fn downstream_pipeline_id(&self) -> Option<PipelineId> {
        match &self.kind {
            JobKind::Bridge {
                downstream_pipeline_id,
                ..
            } => *downstream_pipeline_id,
            JobKind::Build => None,
        }
    }

    pub fn is_latest(&self) -> bool {
        !self.retried
    }

    pub fn scheduling_type(&self) -> SchedulingType {
        if self.needs.is_empty() {
            SchedulingType::Stage
        } else {
            SchedulingType::Dag
        }
    }

    pub fn is_action(&self) -> bool {
        self.when == When::Manual
    }

    pub fn is_schedulable(&self) -> bool {
        !self.is_bridge() && self.when == When::Delayed && self.start_in_secs.is_some()
    }

    pub fn is_playable(&self) -> bool {
        self.is_action() && self.status == Status::Manual
    }

    /// Only the latest build in `failed` or `canceled` can be retried.
    /// Bridges never are.
    pub fn is_retryable(&self) -> bool {
        !self.is_bridge()
            && self.is_latest()
            && matches!(self.status, Status::Failed | Status::Canceled)
    }

    pub fn is_cancelable(&self) -> bool {
        self.status.is_cancelable()
    }

    /// Whether a runner could pick this job right now.
    pub fn is_runnable(&self) -> bool {
        !self.is_bridge() && self.is_latest() && self.status == Status::Pending
    }

    /// Seconds spent running.
    pub fn duration(&self) -> Option<i64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        Some((finished - started).num_seconds())
    }

    /// Seconds spent waiting in `pending`.
    pub fn queued_duration(&self) -> Option<i64> {
        let queued = self.queued_at?;
        let started = self.started_at?;
        Some((started - queued).num_seconds())
    }

    /// A fresh copy of this job for a retry: back to `created`, no timing or
    /// runner information, retry count bumped.
    pub fn retry_copy(&self, new_id: JobId, now: DateTime<Utc>) -> Job {
        Job {
            id: new_id,
            status: Status::Created,
            scheduled_at: None,
            retried: false,
            retry_count: self.retry_count + 1,
            created_at: now,
            queued_at: None,
            started_at: None,
            finished_at: None,
            failure_reason: None,
            runner_id: None,
            auto_canceled_by: None,
            ..self.clone()
        }
    }
}

impl StatusHolder for Job {
    fn status(&self) -> Status {
        self.status
    }

    fn allow_failure(&self) -> bool {
        self.allow_failure
    }
}
