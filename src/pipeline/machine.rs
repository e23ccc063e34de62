// src/pipeline/machine.rs

//! Pipeline state machine.
//!
//! Any non-terminal pipeline may move to any other status. A terminal
//! pipeline (`success`, `failed`, `canceled`, `skipped`) only leaves through
//! `enqueue`, which happens when a retry or a manual play creates new work.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{PipelineFailureReason, PipelineRecord};
use crate::effects::Effect;
use crate::errors::{Subject, TransitionError};
use crate::status::Status;
use crate::types::PipelineId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    Enqueue,
    Prepare,
    Run,
    Skip,
    Drop { reason: Option<PipelineFailureReason> },
    Succeed,
    Cancel,
    Block,
    Delay,
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::Enqueue => "enqueue",
            PipelineEvent::Prepare => "prepare",
            PipelineEvent::Run => "run",
            PipelineEvent::Skip => "skip",
            PipelineEvent::Drop { .. } => "drop",
            PipelineEvent::Succeed => "succeed",
            PipelineEvent::Cancel => "cancel",
            PipelineEvent::Block => "block",
            PipelineEvent::Delay => "delay",
        }
    }

    /// Target status when fired from `from`, or `None` if the event is not
    /// allowed from there.
    pub fn target(&self, from: Status) -> Option<Status> {
        let to = match self {
            PipelineEvent::Enqueue => {
                return match from {
                    Status::Created
                    | Status::Preparing
                    | Status::Skipped
                    | Status::Scheduled
                    | Status::Manual
                    | Status::Pending => Some(Status::Pending),
                    Status::Success | Status::Failed | Status::Canceled => Some(Status::Running),
                    Status::Running => None,
                };
            }
            PipelineEvent::Prepare => Status::Preparing,
            PipelineEvent::Run => Status::Running,
            PipelineEvent::Skip => Status::Skipped,
            PipelineEvent::Drop { .. } => Status::Failed,
            PipelineEvent::Succeed => Status::Success,
            PipelineEvent::Cancel => Status::Canceled,
            PipelineEvent::Block => Status::Manual,
            PipelineEvent::Delay => Status::Scheduled,
        };

        // A terminal pipeline only answers to its own loopback.
        if from.is_completed() && from != to {
            None
        } else {
            Some(to)
        }
    }
}

/// The event `update_status` fires to reach `status`.
pub fn event_for_status(status: Status) -> Option<PipelineEvent> {
    match status {
        Status::Created => None,
        Status::Preparing => Some(PipelineEvent::Prepare),
        Status::Pending => Some(PipelineEvent::Enqueue),
        Status::Running => Some(PipelineEvent::Run),
        Status::Success => Some(PipelineEvent::Succeed),
        Status::Failed => Some(PipelineEvent::Drop { reason: None }),
        Status::Canceled => Some(PipelineEvent::Cancel),
        Status::Skipped => Some(PipelineEvent::Skip),
        Status::Manual => Some(PipelineEvent::Block),
        Status::Scheduled => Some(PipelineEvent::Delay),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineTransition {
    pub pipeline_id: PipelineId,
    pub event: &'static str,
    pub from: Status,
    pub to: Status,
    pub effects: Vec<Effect>,
}

impl PipelineTransition {
    /// The pipeline just reached a terminal status.
    pub fn finished(&self) -> bool {
        self.to.is_completed()
    }
}

/// Fire `event` on the record's pipeline. Loopbacks return `Ok(None)`.
pub fn transition(
    record: &mut PipelineRecord,
    event: PipelineEvent,
    now: DateTime<Utc>,
) -> Result<Option<PipelineTransition>, TransitionError> {
    let from = record.pipeline.status;
    let to = event.target(from).ok_or(TransitionError {
        subject: Subject::Pipeline(record.pipeline.id),
        event: event.name(),
        from,
    })?;

    if from == to {
        return Ok(None);
    }

    record.pipeline.status = to;
    let id = record.pipeline.id;
    let mut effects = Vec::new();

    if from == Status::Canceled {
        record.pipeline.auto_canceled_by = None;
    }

    match to {
        // Only the first run counts; a played manual pipeline comes back
        // through `pending` and keeps its original start.
        Status::Running
            if matches!(from, Status::Created | Status::Preparing | Status::Pending)
                && record.pipeline.started_at.is_none() =>
        {
            record.pipeline.started_at = Some(now);
            effects.push(Effect::RecordPipelineMetrics { pipeline_id: id });
        }
        Status::Success | Status::Failed | Status::Canceled => {
            record.pipeline.finished_at = Some(now);
            record.recompute_duration(now);
        }
        Status::Manual => record.recompute_duration(now),
        _ => {}
    }

    if let PipelineEvent::Drop {
        reason: Some(reason),
    } = event
    {
        record.pipeline.failure_reason = Some(reason);
    }

    if to == Status::Success {
        effects.push(Effect::RecordPipelineMetrics { pipeline_id: id });
        if from.is_active() {
            effects.push(Effect::PipelineSucceeded { pipeline_id: id });
        }
    }

    effects.push(Effect::ExecutePipelineHooks {
        pipeline_id: id,
        status: to,
    });
    effects.push(Effect::ExpirePipelineCache { pipeline_id: id });

    if to.is_completed() {
        effects.push(Effect::ProcessAutoMerge { pipeline_id: id });
    }

    if matches!(to, Status::Success | Status::Failed) {
        effects.push(Effect::SendPipelineNotification {
            pipeline_id: id,
            status: to,
        });
    }

    if to == Status::Failed && record.pipeline.is_auto_devops() {
        effects.push(Effect::DisableAutoDevops { pipeline_id: id });
    }

    if to.is_completed() {
        if let Some(upstream) = record.pipeline.upstream {
            effects.push(Effect::NotifyUpstreamBridge {
                pipeline_id: upstream.pipeline_id,
                bridge_id: upstream.bridge_id,
                downstream_id: id,
                status: to,
            });
        }
    }

    info!(pipeline_id = id, event = event.name(), %from, %to, "pipeline transition");

    Ok(Some(PipelineTransition {
        pipeline_id: id,
        event: event.name(),
        from,
        to,
        effects,
    }))
}

/// Recompute the pipeline status from its jobs and fire the matching event.
///
/// An event that is not valid from the current status is logged and
/// ignored, e.g. `enqueue` on a running pipeline whose next stage just
/// became pending.
pub fn update_status(record: &mut PipelineRecord, now: DateTime<Utc>) -> Option<PipelineTransition> {
    let computed = record.latest_builds_status();
    let mut event = event_for_status(computed)?;

    if let PipelineEvent::Drop { reason } = &mut event {
        if record.pipeline.has_yaml_errors() {
            *reason = Some(PipelineFailureReason::ConfigError);
        }
    }

    match transition(record, event, now) {
        Ok(result) => result,
        Err(err) => {
            debug!(
                pipeline_id = record.pipeline.id,
                %computed,
                error = %err,
                "ignoring pipeline status update"
            );
            None
        }
    }
}
