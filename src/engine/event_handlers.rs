// src/engine/event_handlers.rs

//! Command handlers for the pure core.
//!
//! Every handler changes the record through the job state machine, then
//! runs a processing pass so that the pipeline status and the jobs waiting
//! on the change are brought up to date in the same write.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::bridge::inherit_status_from_downstream;
use crate::dag::{ProcessingStep, process_pipeline};
use crate::errors::{EngineError, Result, Subject, TransitionError};
use crate::job::machine::transition;
use crate::job::{FailureReason, Job, JobEvent, JobKind};
use crate::pipeline::PipelineRecord;
use crate::runner::{BuildMatcher, Runner};
use crate::status::Status;
use crate::types::{JobId, PipelineId, RunnerId};

fn job_mut(record: &mut PipelineRecord, job_id: JobId) -> Result<&mut Job> {
    let pipeline = record.id();
    record
        .job_mut(job_id)
        .ok_or(EngineError::JobNotFound { pipeline, job: job_id })
}

/// Fire `event` on one job and record the change in `step`.
fn fire(
    record: &mut PipelineRecord,
    job_id: JobId,
    event: JobEvent,
    now: DateTime<Utc>,
    step: &mut ProcessingStep,
) -> Result<()> {
    let job = job_mut(record, job_id)?;
    if let Some(t) = transition(job, event, now)? {
        step.push_job(t);
    }
    Ok(())
}

/// Process the record and fold the result into `step`.
fn finish(record: &mut PipelineRecord, now: DateTime<Utc>, mut step: ProcessingStep) -> ProcessingStep {
    step.merge(process_pipeline(record, now));
    step
}

pub fn handle_process(record: &mut PipelineRecord, now: DateTime<Utc>) -> ProcessingStep {
    process_pipeline(record, now)
}

/// Apply a status reported by a runner.
pub fn handle_update_job(
    record: &mut PipelineRecord,
    job_id: JobId,
    status: Status,
    failure_reason: Option<FailureReason>,
    runner_id: Option<RunnerId>,
    now: DateTime<Utc>,
) -> Result<ProcessingStep> {
    let job = job_mut(record, job_id)?;
    let event = match JobEvent::for_reported_status(job.status, status, failure_reason) {
        Some(JobEvent::Run { .. }) => JobEvent::Run { runner_id },
        Some(event) => event,
        None => {
            return Err(TransitionError {
                subject: Subject::Job(job_id),
                event: "report",
                from: job.status,
            }
            .into());
        }
    };

    let mut step = ProcessingStep::default();
    fire(record, job_id, event, now, &mut step)?;
    Ok(finish(record, now, step))
}

/// Start a manual job. Skipped jobs after it are reconsidered.
pub fn handle_play_job(
    record: &mut PipelineRecord,
    job_id: JobId,
    now: DateTime<Utc>,
) -> Result<ProcessingStep> {
    let job = job_mut(record, job_id)?;
    if !job.is_playable() {
        return Err(EngineError::NotPlayable(job_id));
    }
    let stage_idx = job.stage_idx;

    let mut step = ProcessingStep::default();
    fire(record, job_id, JobEvent::Play, now, &mut step)?;
    for t in record.mark_as_processable_after_stage(stage_idx, now) {
        step.push_job(t);
    }
    Ok(finish(record, now, step))
}

/// Replace `job_id` with a fresh copy. Returns the new job's id alongside
/// the flushed transitions.
fn retry_one(record: &mut PipelineRecord, job_id: JobId, now: DateTime<Utc>) -> Result<JobId> {
    let job = job_mut(record, job_id)?;
    if !job.is_retryable() {
        return Err(EngineError::NotRetryable(job_id));
    }
    job.retried = true;
    let old = job.clone();

    let new_id = record.allocate_job_id();
    record.jobs.push(old.retry_copy(new_id, now));
    debug!(
        pipeline_id = record.id(),
        job = %old.name,
        old_id = job_id,
        new_id,
        "job retried"
    );
    Ok(new_id)
}

pub fn handle_retry_job(
    record: &mut PipelineRecord,
    job_id: JobId,
    now: DateTime<Utc>,
) -> Result<ProcessingStep> {
    retry_one(record, job_id, now)?;
    let stage_idx = record.job(job_id).map(|job| job.stage_idx).unwrap_or_default();

    let mut step = ProcessingStep::default();
    for t in record.mark_as_processable_after_stage(stage_idx, now) {
        step.push_job(t);
    }
    Ok(finish(record, now, step))
}

/// Retry every retryable latest build.
pub fn handle_retry_pipeline(
    record: &mut PipelineRecord,
    now: DateTime<Utc>,
) -> Result<ProcessingStep> {
    let retryable: Vec<(JobId, u32)> = record
        .latest_jobs()
        .filter(|job| job.is_retryable())
        .map(|job| (job.id, job.stage_idx))
        .collect();

    let mut step = ProcessingStep::default();
    let Some(first_stage) = retryable.iter().map(|(_, idx)| *idx).min() else {
        debug!(pipeline_id = record.id(), "nothing to retry");
        return Ok(finish(record, now, step));
    };

    for (job_id, _) in retryable {
        retry_one(record, job_id, now)?;
    }
    for t in record.mark_as_processable_after_stage(first_stage, now) {
        step.push_job(t);
    }
    Ok(finish(record, now, step))
}

/// Cancel every cancelable latest job. With `auto_canceled_by`, record the
/// superseding pipeline on the pipeline and on each job.
pub fn handle_cancel_running(
    record: &mut PipelineRecord,
    auto_canceled_by: Option<PipelineId>,
    now: DateTime<Utc>,
) -> Result<ProcessingStep> {
    let cancelable: Vec<JobId> = record
        .latest_jobs()
        .filter(|job| job.is_cancelable())
        .map(|job| job.id)
        .collect();

    if auto_canceled_by.is_some() && !cancelable.is_empty() {
        record.pipeline.auto_canceled_by = auto_canceled_by;
    }

    let mut step = ProcessingStep::default();
    for job_id in cancelable {
        fire(record, job_id, JobEvent::Cancel { auto_canceled_by }, now, &mut step)?;
    }
    Ok(finish(record, now, step))
}

pub fn handle_enqueue_due_scheduled(
    record: &mut PipelineRecord,
    now: DateTime<Utc>,
) -> Result<ProcessingStep> {
    let due: Vec<JobId> = record
        .latest_jobs()
        .filter(|job| job.status == Status::Scheduled)
        .filter(|job| job.scheduled_at.is_some_and(|at| at <= now))
        .map(|job| job.id)
        .collect();

    let mut step = ProcessingStep::default();
    for job_id in due {
        fire(record, job_id, JobEvent::EnqueueScheduled, now, &mut step)?;
    }
    Ok(finish(record, now, step))
}

/// Turn a scheduled job back into a manual one.
pub fn handle_unschedule_job(
    record: &mut PipelineRecord,
    job_id: JobId,
    now: DateTime<Utc>,
) -> Result<ProcessingStep> {
    let mut step = ProcessingStep::default();
    fire(record, job_id, JobEvent::Unschedule, now, &mut step)?;
    Ok(finish(record, now, step))
}

/// Record the downstream pipeline on its bridge. A dependent bridge keeps
/// running until the downstream pipeline finishes; any other bridge
/// succeeds right away.
pub fn handle_downstream_created(
    record: &mut PipelineRecord,
    bridge_id: JobId,
    downstream_id: PipelineId,
    now: DateTime<Utc>,
) -> Result<ProcessingStep> {
    let bridge = job_mut(record, bridge_id)?;
    let JobKind::Bridge {
        trigger,
        downstream_pipeline_id,
    } = &mut bridge.kind
    else {
        return Err(crate::bridge::BridgeError::NotABridge(bridge_id).into());
    };
    *downstream_pipeline_id = Some(downstream_id);
    let dependent = trigger.is_dependent();

    let mut step = ProcessingStep::default();
    if bridge.status != Status::Pending {
        debug!(
            bridge_id,
            status = %bridge.status,
            "bridge moved on before its downstream pipeline was created"
        );
        return Ok(finish(record, now, step));
    }

    let event = if dependent {
        JobEvent::Run { runner_id: None }
    } else {
        JobEvent::Succeed
    };
    fire(record, bridge_id, event, now, &mut step)?;
    Ok(finish(record, now, step))
}

pub fn handle_downstream_failed(
    record: &mut PipelineRecord,
    bridge_id: JobId,
    reason: FailureReason,
    now: DateTime<Utc>,
) -> Result<ProcessingStep> {
    let mut step = ProcessingStep::default();
    fire(record, bridge_id, JobEvent::Drop { reason }, now, &mut step)?;
    Ok(finish(record, now, step))
}

/// Mirror a finished downstream pipeline onto a dependent bridge.
pub fn handle_inherit_from_downstream(
    record: &mut PipelineRecord,
    bridge_id: JobId,
    status: Status,
    now: DateTime<Utc>,
) -> Result<ProcessingStep> {
    let bridge = job_mut(record, bridge_id)?;
    let mut step = ProcessingStep::default();

    let dependent = bridge.trigger().is_some_and(|t| t.is_dependent());
    if !dependent {
        debug!(bridge_id, %status, "bridge does not depend on its downstream pipeline");
        return Ok(finish(record, now, step));
    }

    if let Some(t) = inherit_status_from_downstream(bridge, status, now)? {
        step.push_job(t);
    }
    Ok(finish(record, now, step))
}

/// Give the first pending job `runner` can take to it.
pub fn handle_pick_job(
    record: &mut PipelineRecord,
    runner: &Runner,
    now: DateTime<Utc>,
) -> Result<ProcessingStep> {
    let protected = record.pipeline.protected_ref;
    let picked = record
        .latest_jobs()
        .filter(|job| job.is_runnable())
        .find(|job| runner.matches_build(&BuildMatcher::new(job, protected)))
        .map(|job| job.id);

    let mut step = ProcessingStep::default();
    match picked {
        Some(job_id) => {
            fire(
                record,
                job_id,
                JobEvent::Run {
                    runner_id: Some(runner.id),
                },
                now,
                &mut step,
            )?;
            Ok(finish(record, now, step))
        }
        None => Ok(step),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{TriggerConfig, TriggerStrategy};
    use crate::job::When;
    use crate::pipeline::Pipeline;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn record(jobs: &[(&str, u32)]) -> PipelineRecord {
        let mut rec = PipelineRecord::new(Pipeline::new(1, "group/app", "main", "abc", now()));
        for (name, idx) in jobs {
            rec.push_job(Job::build(0, 1, *name, format!("s{idx}"), *idx, now()));
        }
        process_pipeline(&mut rec, now());
        rec
    }

    fn id_of(rec: &PipelineRecord, name: &str) -> JobId {
        rec.latest_job_named(name).unwrap().id
    }

    fn status_of(rec: &PipelineRecord, name: &str) -> Status {
        rec.latest_job_named(name).unwrap().status
    }

    fn report(rec: &mut PipelineRecord, name: &str, status: Status) -> ProcessingStep {
        let id = id_of(rec, name);
        handle_update_job(rec, id, status, None, None, now()).unwrap()
    }

    #[test]
    fn success_advances_the_next_stage() {
        let mut rec = record(&[("build", 0), ("test", 1)]);
        report(&mut rec, "build", Status::Running);
        assert_eq!(rec.status(), Status::Running);

        let step = report(&mut rec, "build", Status::Success);
        assert_eq!(status_of(&rec, "test"), Status::Pending);
        assert_eq!(step.job_transitions.len(), 2);
    }

    #[test]
    fn unreportable_status_is_rejected() {
        let mut rec = record(&[("build", 0)]);
        let id = id_of(&rec, "build");
        let err = handle_update_job(&mut rec, id, Status::Manual, None, None, now()).unwrap_err();
        assert!(matches!(err, EngineError::Transition(_)));
    }

    #[test]
    fn a_scheduled_job_reported_pending_waits_for_its_time() {
        let mut rec = PipelineRecord::new(Pipeline::new(1, "group/app", "main", "abc", now()));
        let mut job = Job::build(0, 1, "rollout", "deploy", 0, now());
        job.when = When::Delayed;
        job.start_in_secs = Some(60);
        rec.push_job(job);
        process_pipeline(&mut rec, now());
        assert_eq!(status_of(&rec, "rollout"), Status::Scheduled);

        let id = id_of(&rec, "rollout");
        let err = handle_update_job(&mut rec, id, Status::Pending, None, None, now()).unwrap_err();
        assert!(matches!(err, EngineError::Transition(_)));
        assert_eq!(status_of(&rec, "rollout"), Status::Scheduled);

        let later = now() + chrono::Duration::seconds(60);
        handle_update_job(&mut rec, id, Status::Pending, None, None, later).unwrap();
        assert_eq!(status_of(&rec, "rollout"), Status::Pending);
    }

    #[test]
    fn retrying_a_failed_job_reopens_the_pipeline() {
        let mut rec = record(&[("build", 0), ("test", 1)]);
        report(&mut rec, "build", Status::Running);
        report(&mut rec, "build", Status::Failed);
        assert_eq!(status_of(&rec, "test"), Status::Skipped);
        assert_eq!(rec.status(), Status::Failed);

        let old = id_of(&rec, "build");
        handle_retry_job(&mut rec, old, now()).unwrap();

        assert!(rec.job(old).unwrap().retried);
        let new = rec.latest_job_named("build").unwrap();
        assert_eq!(new.retry_count, 1);
        assert_eq!(new.status, Status::Pending);
        assert_eq!(status_of(&rec, "test"), Status::Created);
        assert_eq!(rec.status(), Status::Running);

        report(&mut rec, "build", Status::Running);
        report(&mut rec, "build", Status::Success);
        assert_eq!(status_of(&rec, "test"), Status::Pending);
        assert_eq!(rec.total_size(), 3);
    }

    #[test]
    fn successful_jobs_are_not_retryable() {
        let mut rec = record(&[("build", 0)]);
        report(&mut rec, "build", Status::Success);
        let id = id_of(&rec, "build");
        assert!(matches!(
            handle_retry_job(&mut rec, id, now()),
            Err(EngineError::NotRetryable(_))
        ));
    }

    #[test]
    fn retry_pipeline_retries_every_failed_build() {
        let mut rec = record(&[("a", 0), ("b", 0), ("c", 1)]);
        report(&mut rec, "a", Status::Failed);
        report(&mut rec, "b", Status::Failed);
        assert_eq!(rec.status(), Status::Failed);

        handle_retry_pipeline(&mut rec, now()).unwrap();
        assert_eq!(status_of(&rec, "a"), Status::Pending);
        assert_eq!(status_of(&rec, "b"), Status::Pending);
        assert_eq!(status_of(&rec, "c"), Status::Created);
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut rec = record(&[("build", 0), ("test", 1)]);
        report(&mut rec, "build", Status::Running);

        handle_cancel_running(&mut rec, Some(9), now()).unwrap();
        assert_eq!(status_of(&rec, "build"), Status::Canceled);
        assert_eq!(status_of(&rec, "test"), Status::Canceled);
        assert_eq!(rec.status(), Status::Canceled);
        assert_eq!(rec.pipeline.auto_canceled_by, Some(9));
        assert_eq!(rec.latest_job_named("build").unwrap().auto_canceled_by, Some(9));

        let snapshot = rec.clone();
        let step = handle_cancel_running(&mut rec, Some(9), now()).unwrap();
        assert!(step.job_transitions.is_empty());
        assert_eq!(rec, snapshot);
    }

    #[test]
    fn playing_a_manual_job() {
        let mut rec = PipelineRecord::new(Pipeline::new(1, "group/app", "main", "abc", now()));
        let mut deploy = Job::build(0, 1, "deploy", "deploy", 0, now());
        deploy.when = When::Manual;
        let id = rec.push_job(deploy);
        process_pipeline(&mut rec, now());
        assert_eq!(rec.status(), Status::Manual);

        handle_play_job(&mut rec, id, now()).unwrap();
        assert_eq!(status_of(&rec, "deploy"), Status::Pending);
        assert_eq!(rec.status(), Status::Pending);

        assert!(matches!(
            handle_play_job(&mut rec, id, now()),
            Err(EngineError::NotPlayable(_))
        ));
    }

    #[test]
    fn scheduled_jobs_are_enqueued_when_due() {
        let mut rec = PipelineRecord::new(Pipeline::new(1, "group/app", "main", "abc", now()));
        let mut rollout = Job::build(0, 1, "rollout", "deploy", 0, now());
        rollout.when = When::Delayed;
        rollout.start_in_secs = Some(60);
        rec.push_job(rollout);
        process_pipeline(&mut rec, now());
        assert_eq!(status_of(&rec, "rollout"), Status::Scheduled);

        let early = now() + chrono::Duration::seconds(30);
        handle_enqueue_due_scheduled(&mut rec, early).unwrap();
        assert_eq!(status_of(&rec, "rollout"), Status::Scheduled);

        let due = now() + chrono::Duration::seconds(60);
        handle_enqueue_due_scheduled(&mut rec, due).unwrap();
        assert_eq!(status_of(&rec, "rollout"), Status::Pending);
    }

    #[test]
    fn unscheduling_makes_the_job_manual() {
        let mut rec = PipelineRecord::new(Pipeline::new(1, "group/app", "main", "abc", now()));
        let mut rollout = Job::build(0, 1, "rollout", "deploy", 0, now());
        rollout.when = When::Delayed;
        rollout.start_in_secs = Some(60);
        let id = rec.push_job(rollout);
        process_pipeline(&mut rec, now());

        handle_unschedule_job(&mut rec, id, now()).unwrap();
        let job = rec.job(id).unwrap();
        assert_eq!(job.status, Status::Manual);
        assert_eq!(job.scheduled_at, None);
        assert_eq!(rec.status(), Status::Manual);
    }

    fn bridge_record(strategy: Option<TriggerStrategy>) -> (PipelineRecord, JobId) {
        let mut rec = PipelineRecord::new(Pipeline::new(1, "group/app", "main", "abc", now()));
        let trigger = TriggerConfig {
            include: vec!["child.toml".into()],
            strategy,
            ..TriggerConfig::default()
        };
        let id = rec.push_job(Job::bridge(0, 1, "child", "deploy", 0, trigger, now()));
        process_pipeline(&mut rec, now());
        (rec, id)
    }

    #[test]
    fn independent_bridge_succeeds_once_downstream_exists() {
        let (mut rec, id) = bridge_record(None);
        assert_eq!(rec.job(id).unwrap().status, Status::Pending);

        handle_downstream_created(&mut rec, id, 2, now()).unwrap();
        let bridge = rec.job(id).unwrap();
        assert_eq!(bridge.status, Status::Success);
        assert_eq!(bridge.downstream_pipeline_id(), Some(2));
        assert_eq!(rec.status(), Status::Success);

        // Later completion of the child does not touch the bridge.
        handle_inherit_from_downstream(&mut rec, id, Status::Failed, now()).unwrap();
        assert_eq!(rec.job(id).unwrap().status, Status::Success);
    }

    #[test]
    fn dependent_bridge_mirrors_the_downstream_result() {
        let (mut rec, id) = bridge_record(Some(TriggerStrategy::Depend));
        handle_downstream_created(&mut rec, id, 2, now()).unwrap();
        assert_eq!(rec.job(id).unwrap().status, Status::Running);
        assert_eq!(rec.status(), Status::Running);

        handle_inherit_from_downstream(&mut rec, id, Status::Failed, now()).unwrap();
        let bridge = rec.job(id).unwrap();
        assert_eq!(bridge.status, Status::Failed);
        assert_eq!(bridge.failure_reason, Some(FailureReason::DownstreamPipelineFailed));
        assert_eq!(rec.status(), Status::Failed);
    }

    #[test]
    fn failed_downstream_creation_drops_the_bridge() {
        let (mut rec, id) = bridge_record(None);
        handle_downstream_failed(&mut rec, id, FailureReason::InsufficientBridgePermissions, now())
            .unwrap();
        let bridge = rec.job(id).unwrap();
        assert_eq!(bridge.status, Status::Failed);
        assert_eq!(
            bridge.failure_reason,
            Some(FailureReason::InsufficientBridgePermissions)
        );
    }

    #[test]
    fn runners_only_pick_matching_jobs() {
        let mut rec = record(&[("linux", 0), ("mac", 0)]);
        rec.job_mut(id_of(&rec, "linux")).unwrap().tags = vec!["linux".into()];
        rec.job_mut(id_of(&rec, "mac")).unwrap().tags = vec!["macos".into()];

        let runner = Runner::new(3, "mac-mini", now()).with_tags(["macos"]);
        let step = handle_pick_job(&mut rec, &runner, now()).unwrap();
        assert_eq!(step.job_transitions[0].job_id, id_of(&rec, "mac"));
        assert_eq!(rec.latest_job_named("mac").unwrap().runner_id, Some(3));
        assert_eq!(status_of(&rec, "linux"), Status::Pending);

        let step = handle_pick_job(&mut rec, &runner, now()).unwrap();
        assert!(step.is_empty());
    }
}
