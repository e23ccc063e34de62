// src/engine/core.rs

//! Pure command application.
//!
//! [`apply`] takes one pipeline record and one [`EngineCommand`] and changes
//! the record in place, returning what happened as a [`ProcessingStep`]. It
//! has no channels, no Tokio types and performs no IO, so the optimistic
//! locking loop can run it again on a fresh copy after a conflict.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::dag::ProcessingStep;
use crate::engine::EngineCommand;
use crate::engine::event_handlers::{
    handle_cancel_running, handle_downstream_created, handle_downstream_failed,
    handle_enqueue_due_scheduled, handle_inherit_from_downstream, handle_pick_job,
    handle_play_job, handle_process, handle_retry_job, handle_retry_pipeline,
    handle_unschedule_job, handle_update_job,
};
use crate::errors::Result;
use crate::pipeline::PipelineRecord;

/// Apply a command to a pipeline record.
pub fn apply(
    record: &mut PipelineRecord,
    command: &EngineCommand,
    now: DateTime<Utc>,
) -> Result<ProcessingStep> {
    debug!(pipeline_id = record.id(), command = command.name(), "applying command");

    match command {
        EngineCommand::Process => Ok(handle_process(record, now)),
        EngineCommand::UpdateJob {
            job_id,
            status,
            failure_reason,
            runner_id,
        } => handle_update_job(record, *job_id, *status, *failure_reason, *runner_id, now),
        EngineCommand::PlayJob { job_id } => handle_play_job(record, *job_id, now),
        EngineCommand::RetryJob { job_id } => handle_retry_job(record, *job_id, now),
        EngineCommand::RetryPipeline => handle_retry_pipeline(record, now),
        EngineCommand::CancelRunning => handle_cancel_running(record, None, now),
        EngineCommand::AutoCancelRunning { by } => handle_cancel_running(record, Some(*by), now),
        EngineCommand::EnqueueDueScheduled => handle_enqueue_due_scheduled(record, now),
        EngineCommand::UnscheduleJob { job_id } => handle_unschedule_job(record, *job_id, now),
        EngineCommand::DownstreamCreated {
            bridge_id,
            downstream_id,
        } => handle_downstream_created(record, *bridge_id, *downstream_id, now),
        EngineCommand::DownstreamFailed { bridge_id, reason } => {
            handle_downstream_failed(record, *bridge_id, *reason, now)
        }
        EngineCommand::InheritFromDownstream { bridge_id, status } => {
            handle_inherit_from_downstream(record, *bridge_id, *status, now)
        }
        EngineCommand::PickJob { runner } => handle_pick_job(record, runner, now),
    }
}
