// src/job/machine.rs

//! Per-job state machine.
//!
//! [`transition`] is pure apart from mutating the job it is handed: it
//! validates the event against the current status, stamps timestamps and
//! returns the effects the change implies. A loopback (the job already holds
//! the target status) is a no-op and returns `Ok(None)`.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::{FailureReason, Job};
use crate::effects::Effect;
use crate::errors::{Subject, TransitionError};
use crate::status::Status;
use crate::types::{JobId, PipelineId, RunnerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Process,
    Enqueue,
    Prepare,
    Run { runner_id: Option<RunnerId> },
    Skip,
    Drop { reason: FailureReason },
    Succeed,
    Cancel { auto_canceled_by: Option<PipelineId> },
    Actionize,
    Schedule,
    Unschedule,
    EnqueueScheduled,
    Play,
}

use Status::*;

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Process => "process",
            JobEvent::Enqueue => "enqueue",
            JobEvent::Prepare => "prepare",
            JobEvent::Run { .. } => "run",
            JobEvent::Skip => "skip",
            JobEvent::Drop { .. } => "drop",
            JobEvent::Succeed => "succeed",
            JobEvent::Cancel { .. } => "cancel",
            JobEvent::Actionize => "actionize",
            JobEvent::Schedule => "schedule",
            JobEvent::Unschedule => "unschedule",
            JobEvent::EnqueueScheduled => "enqueue_scheduled",
            JobEvent::Play => "play",
        }
    }

    pub fn target(&self) -> Status {
        match self {
            JobEvent::Process => Created,
            JobEvent::Enqueue | JobEvent::EnqueueScheduled | JobEvent::Play => Pending,
            JobEvent::Prepare => Preparing,
            JobEvent::Run { .. } => Running,
            JobEvent::Skip => Skipped,
            JobEvent::Drop { .. } => Failed,
            JobEvent::Succeed => Success,
            JobEvent::Cancel { .. } => Canceled,
            JobEvent::Actionize | JobEvent::Unschedule => Manual,
            JobEvent::Schedule => Scheduled,
        }
    }

    /// Statuses this event may fire from.
    pub fn allowed_from(&self) -> &'static [Status] {
        match self {
            JobEvent::Process => &[Skipped, Manual],
            JobEvent::Enqueue => &[Created, Preparing, Skipped, Manual, Scheduled],
            JobEvent::Prepare => &[Created],
            JobEvent::Run { .. } => &[Pending],
            JobEvent::Skip => &[Created, Preparing, Pending],
            JobEvent::Drop { .. } | JobEvent::Cancel { .. } => {
                &[Created, Preparing, Pending, Running, Manual, Scheduled]
            }
            JobEvent::Succeed => &[Created, Preparing, Pending, Running],
            JobEvent::Actionize | JobEvent::Schedule => &[Created],
            JobEvent::Unschedule | JobEvent::EnqueueScheduled => &[Scheduled],
            JobEvent::Play => &[Manual],
        }
    }

    /// The event a reported status maps to for a job currently in `from`,
    /// if any. A scheduled job only becomes pending once its time has come.
    pub fn for_reported_status(
        from: Status,
        status: Status,
        reason: Option<FailureReason>,
    ) -> Option<JobEvent> {
        match status {
            Running => Some(JobEvent::Run { runner_id: None }),
            Success => Some(JobEvent::Succeed),
            Failed => Some(JobEvent::Drop {
                reason: reason.unwrap_or_default(),
            }),
            Canceled => Some(JobEvent::Cancel {
                auto_canceled_by: None,
            }),
            Skipped => Some(JobEvent::Skip),
            Pending if from == Scheduled => Some(JobEvent::EnqueueScheduled),
            Pending => Some(JobEvent::Enqueue),
            Preparing => Some(JobEvent::Prepare),
            Created | Manual | Scheduled => None,
        }
    }
}

/// A status change that was applied to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTransition {
    pub job_id: JobId,
    pub event: &'static str,
    pub from: Status,
    pub to: Status,
    pub effects: Vec<Effect>,
}

/// Fire `event` on `job`.
pub fn transition(
    job: &mut Job,
    event: JobEvent,
    now: DateTime<Utc>,
) -> Result<Option<JobTransition>, TransitionError> {
    let from = job.status;
    let to = event.target();

    if from == to {
        return Ok(None);
    }

    let reject = || TransitionError {
        subject: Subject::Job(job.id),
        event: event.name(),
        from,
    };

    if !event.allowed_from().contains(&from) {
        return Err(reject());
    }

    if event == JobEvent::EnqueueScheduled {
        match job.scheduled_at {
            Some(at) if at <= now => {}
            _ => return Err(reject()),
        }
    }

    job.status = to;
    let mut effects = Vec::new();

    match to {
        Pending => {
            job.queued_at = Some(now);
            if job.is_bridge() {
                if matches!(from, Created | Manual) {
                    effects.push(Effect::CreateDownstreamPipeline {
                        pipeline_id: job.pipeline_id,
                        bridge_id: job.id,
                    });
                }
            } else {
                effects.push(Effect::TickRunnerQueue {
                    pipeline_id: job.pipeline_id,
                    job_id: job.id,
                });
            }
        }
        Running => {
            job.started_at = Some(now);
            if let JobEvent::Run {
                runner_id: Some(runner),
            } = event
            {
                job.runner_id = Some(runner);
            }
        }
        Success => {
            job.finished_at = Some(now);
        }
        Failed => {
            job.finished_at = Some(now);
            let reason = match event {
                JobEvent::Drop { reason } => reason,
                _ => FailureReason::UnknownFailure,
            };
            job.failure_reason = Some(reason);
            effects.push(Effect::RecordJobFailure {
                job_id: job.id,
                reason,
            });
        }
        Canceled => {
            job.finished_at = Some(now);
            if let JobEvent::Cancel {
                auto_canceled_by: Some(by),
            } = event
            {
                job.auto_canceled_by = Some(by);
            }
        }
        Scheduled => {
            let delay = job.start_in_secs.unwrap_or(0);
            job.scheduled_at = Some(now + Duration::seconds(delay as i64));
        }
        Manual => {
            if from == Scheduled {
                job.scheduled_at = None;
            }
        }
        Created | Preparing | Skipped => {}
    }

    debug!(
        job_id = job.id,
        job = %job.name,
        event = event.name(),
        %from,
        %to,
        "job transition"
    );

    Ok(Some(JobTransition {
        job_id: job.id,
        event: event.name(),
        from,
        to,
        effects,
    }))
}
