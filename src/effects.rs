// src/effects.rs

//! Side effects produced by state transitions.
//!
//! Transitions never perform IO. They return `Effect` values and the caller
//! decides when (after a successful write) and how to carry them out.

use crate::job::FailureReason;
use crate::status::Status;
use crate::types::{JobId, PipelineId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// A build became pending: wake runners that could pick it.
    TickRunnerQueue { pipeline_id: PipelineId, job_id: JobId },
    /// A bridge became pending and triggers downstream work.
    CreateDownstreamPipeline { pipeline_id: PipelineId, bridge_id: JobId },
    /// A downstream pipeline completed; its upstream bridge may inherit the
    /// status.
    NotifyUpstreamBridge {
        pipeline_id: PipelineId,
        bridge_id: JobId,
        downstream_id: PipelineId,
        status: Status,
    },
    /// A job entered `failed`.
    RecordJobFailure { job_id: JobId, reason: FailureReason },
    ExecutePipelineHooks { pipeline_id: PipelineId, status: Status },
    ExpirePipelineCache { pipeline_id: PipelineId },
    RecordPipelineMetrics { pipeline_id: PipelineId },
    PipelineSucceeded { pipeline_id: PipelineId },
    SendPipelineNotification { pipeline_id: PipelineId, status: Status },
    /// Re-evaluate auto-merge for merge requests this pipeline belongs to.
    ProcessAutoMerge { pipeline_id: PipelineId },
    DisableAutoDevops { pipeline_id: PipelineId },
}

impl Effect {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Effect::TickRunnerQueue { .. } => "tick_runner_queue",
            Effect::CreateDownstreamPipeline { .. } => "create_downstream_pipeline",
            Effect::NotifyUpstreamBridge { .. } => "notify_upstream_bridge",
            Effect::RecordJobFailure { .. } => "record_job_failure",
            Effect::ExecutePipelineHooks { .. } => "execute_pipeline_hooks",
            Effect::ExpirePipelineCache { .. } => "expire_pipeline_cache",
            Effect::RecordPipelineMetrics { .. } => "record_pipeline_metrics",
            Effect::PipelineSucceeded { .. } => "pipeline_succeeded",
            Effect::SendPipelineNotification { .. } => "send_pipeline_notification",
            Effect::ProcessAutoMerge { .. } => "process_auto_merge",
            Effect::DisableAutoDevops { .. } => "disable_auto_devops",
        }
    }

    /// Effects the engine itself must act on, as opposed to fire-and-forget
    /// notifications handed to the dispatcher.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Effect::CreateDownstreamPipeline { .. } | Effect::NotifyUpstreamBridge { .. }
        )
    }
}
