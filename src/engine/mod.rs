// src/engine/mod.rs

//! Orchestration engine.
//!
//! This module ties together:
//! - the pure command handlers that change one pipeline record
//! - the optimistic-locking write loop around them
//! - effect dispatch, downstream pipeline creation and runner job picking
//! - the runtime event loop that reacts to:
//!   - runner status reports
//!   - user actions (play, retry, cancel)
//!   - scheduler ticks
//!   - shutdown signals
//!
//! The pure core lives in [`core`] and [`event_handlers`]; the async/IO
//! shell is implemented in [`service`] and [`runtime`].

use chrono::{DateTime, Utc};

use crate::job::FailureReason;
use crate::runner::Runner;
use crate::status::Status;
use crate::types::{JobId, PipelineId, RunnerId};

/// A change to apply to a single pipeline record.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    /// Run the processing pass and nothing else.
    Process,
    /// A runner reported a job status.
    UpdateJob {
        job_id: JobId,
        status: Status,
        failure_reason: Option<FailureReason>,
        runner_id: Option<RunnerId>,
    },
    PlayJob {
        job_id: JobId,
    },
    RetryJob {
        job_id: JobId,
    },
    RetryPipeline,
    CancelRunning,
    AutoCancelRunning {
        by: PipelineId,
    },
    EnqueueDueScheduled,
    UnscheduleJob {
        job_id: JobId,
    },
    DownstreamCreated {
        bridge_id: JobId,
        downstream_id: PipelineId,
    },
    DownstreamFailed {
        bridge_id: JobId,
        reason: FailureReason,
    },
    InheritFromDownstream {
        bridge_id: JobId,
        status: Status,
    },
    /// Hand the first matching pending job to this runner.
    PickJob {
        runner: Runner,
    },
}

impl EngineCommand {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            EngineCommand::Process => "process",
            EngineCommand::UpdateJob { .. } => "update_job",
            EngineCommand::PlayJob { .. } => "play_job",
            EngineCommand::RetryJob { .. } => "retry_job",
            EngineCommand::RetryPipeline => "retry_pipeline",
            EngineCommand::CancelRunning => "cancel_running",
            EngineCommand::AutoCancelRunning { .. } => "auto_cancel_running",
            EngineCommand::EnqueueDueScheduled => "enqueue_due_scheduled",
            EngineCommand::UnscheduleJob { .. } => "unschedule_job",
            EngineCommand::DownstreamCreated { .. } => "downstream_created",
            EngineCommand::DownstreamFailed { .. } => "downstream_failed",
            EngineCommand::InheritFromDownstream { .. } => "inherit_from_downstream",
            EngineCommand::PickJob { .. } => "pick_job",
        }
    }
}

/// Runtime options for the async shell.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    /// If true, exit the runtime once every pipeline is completed or waits
    /// on a manual action.
    pub exit_when_idle: bool,
}

/// Events flowing into the runtime from runners, users and timers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A runner reported a new status for a job.
    JobUpdated {
        pipeline_id: PipelineId,
        job_id: JobId,
        status: Status,
        failure_reason: Option<FailureReason>,
    },
    JobPlayed {
        pipeline_id: PipelineId,
        job_id: JobId,
    },
    JobRetried {
        pipeline_id: PipelineId,
        job_id: JobId,
    },
    PipelineRetried {
        pipeline_id: PipelineId,
    },
    PipelineCanceled {
        pipeline_id: PipelineId,
    },
    /// A newer pipeline on the same ref supersedes this one.
    PipelineAutoCanceled {
        pipeline_id: PipelineId,
        by: PipelineId,
    },
    /// Enqueue every scheduled job that is due at `now`.
    ScheduledTick {
        now: DateTime<Utc>,
    },
    /// A downstream pipeline finished outside this engine.
    DownstreamFinished {
        pipeline_id: PipelineId,
        bridge_id: JobId,
        status: Status,
    },
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

pub mod core;
pub mod event_handlers;
pub mod runtime;
pub mod service;

pub use self::core::apply;
pub use runtime::Runtime;
pub use service::{Engine, EngineSettings, PickedJob};
