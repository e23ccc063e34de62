// src/engine/service.rs

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::bridge::downstream_pipeline_params;
use crate::bridge::scoped_variables;
use crate::bridge::variables::Variable;
use crate::config::ConfigFile;
use crate::dag::ProcessingStep;
use crate::effects::Effect;
use crate::engine::core::apply;
use crate::engine::{EngineCommand, EngineEvent};
use crate::errors::{EngineError, Result};
use crate::exec::{DownstreamService, EffectDispatcher};
use crate::job::{FailureReason, Job};
use crate::pipeline::{Pipeline, PipelineRecord};
use crate::runner::{BuildMatcher, HeartbeatInfo, ResolvedTimeout, Runner, resolve_timeout};
use crate::status::Status;
use crate::store::{PipelineStore, RetryPolicy, retry_optimistic_lock};
use crate::types::{JobId, PipelineId, RunnerId, StageMode};

/// Knobs taken from the `[engine]` and `[project]` sections.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    pub stage_mode: StageMode,
    /// Used for jobs without their own timeout.
    pub build_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stage_mode: StageMode::default(),
            build_timeout_secs: 3600,
        }
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        let base = std::time::Duration::from_millis(cfg.engine.optimistic_lock_backoff_ms);
        Self {
            retry: RetryPolicy {
                max_attempts: cfg.engine.optimistic_lock_attempts,
                base_backoff: base,
                max_backoff: RetryPolicy::default().max_backoff.max(base),
            },
            stage_mode: cfg.engine.stage_mode,
            build_timeout_secs: cfg.project.build_timeout_secs,
        }
    }
}

/// A job handed to a runner.
#[derive(Debug, Clone, PartialEq)]
pub struct PickedJob {
    pub pipeline_id: PipelineId,
    pub job: Job,
    pub timeout: ResolvedTimeout,
    pub variables: Vec<Variable>,
}

/// Owns the store and the outside collaborators, and applies commands to
/// pipelines through the optimistic-locking loop.
///
/// Effects are dispatched only after the write that produced them
/// succeeded. Effects that concern the engine itself (downstream creation,
/// upstream notification, runner queues) are turned into follow-up
/// commands and run in order until none are left.
pub struct Engine {
    store: Arc<dyn PipelineStore>,
    dispatcher: Arc<dyn EffectDispatcher>,
    downstream: Arc<dyn DownstreamService>,
    runners: Mutex<HashMap<RunnerId, Runner>>,
    settings: EngineSettings,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        dispatcher: Arc<dyn EffectDispatcher>,
        downstream: Arc<dyn DownstreamService>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            downstream,
            runners: Mutex::new(HashMap::new()),
            settings,
        }
    }

    pub fn store(&self) -> &dyn PipelineStore {
        self.store.as_ref()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn runners(&self) -> MutexGuard<'_, HashMap<RunnerId, Runner>> {
        self.runners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A copy of the stored pipeline record.
    pub fn pipeline(&self, id: PipelineId) -> Result<PipelineRecord> {
        match self.store.load(id) {
            Ok(versioned) => Ok(versioned.value),
            Err(crate::store::StoreError::NotFound(_)) => Err(EngineError::PipelineNotFound(id)),
            Err(err) => Err(err.into()),
        }
    }

    /// A header for a new pipeline with freshly allocated id and iid.
    pub fn new_pipeline_header(
        &self,
        project: &str,
        git_ref: &str,
        sha: &str,
        now: DateTime<Utc>,
    ) -> Pipeline {
        let id = self.store.allocate_pipeline_id();
        let mut pipeline = Pipeline::new(id, project, git_ref, sha, now);
        pipeline.iid = self.store.allocate_iid(project);
        pipeline
    }

    /// Store a seeded record and run its first processing pass.
    pub async fn create_pipeline(&self, record: PipelineRecord) -> Result<ProcessingStep> {
        let id = record.id();
        let jobs = record.jobs.len();
        self.store.insert(record)?;
        info!(pipeline_id = id, jobs, "pipeline created");
        self.execute(id, EngineCommand::Process).await
    }

    /// Apply `command` to a pipeline at the current time.
    pub async fn execute(&self, id: PipelineId, command: EngineCommand) -> Result<ProcessingStep> {
        self.execute_at(id, command, Utc::now()).await
    }

    /// Apply `command` to a pipeline, dispatch its effects and run every
    /// follow-up command they lead to. Returns the step of `command` itself;
    /// failures of follow-ups are logged.
    pub async fn execute_at(
        &self,
        id: PipelineId,
        command: EngineCommand,
        now: DateTime<Utc>,
    ) -> Result<ProcessingStep> {
        let step = self.write(id, &command, now).await?;
        let mut queue: VecDeque<(PipelineId, EngineCommand)> =
            self.dispatch(id, &step, now).await.into();

        while let Some((next_id, next)) = queue.pop_front() {
            match self.write(next_id, &next, now).await {
                Ok(next_step) => queue.extend(self.dispatch(next_id, &next_step, now).await),
                Err(err) => warn!(
                    pipeline_id = next_id,
                    command = next.name(),
                    error = %err,
                    "follow-up command failed"
                ),
            }
        }

        Ok(step)
    }

    async fn write(
        &self,
        id: PipelineId,
        command: &EngineCommand,
        now: DateTime<Utc>,
    ) -> Result<ProcessingStep> {
        retry_optimistic_lock(self.store.as_ref(), id, self.settings.retry, |record| {
            apply(record, command, now)
        })
        .await
    }

    /// Hand external effects to the dispatcher and turn internal ones into
    /// follow-up commands.
    async fn dispatch(
        &self,
        id: PipelineId,
        step: &ProcessingStep,
        now: DateTime<Utc>,
    ) -> Vec<(PipelineId, EngineCommand)> {
        let mut follow_ups = Vec::new();
        let mut external = Vec::new();

        for effect in step.effects() {
            match effect {
                Effect::CreateDownstreamPipeline {
                    pipeline_id,
                    bridge_id,
                } => {
                    follow_ups.extend(self.create_downstream(pipeline_id, bridge_id, now).await);
                }
                Effect::NotifyUpstreamBridge {
                    pipeline_id,
                    bridge_id,
                    downstream_id,
                    status,
                } => {
                    debug!(pipeline_id, bridge_id, downstream_id, %status, "notifying upstream bridge");
                    follow_ups.push((
                        pipeline_id,
                        EngineCommand::InheritFromDownstream { bridge_id, status },
                    ));
                }
                Effect::TickRunnerQueue { pipeline_id, job_id } => {
                    self.tick_runner_queues(pipeline_id, job_id, now);
                    external.push(effect);
                }
                other => external.push(other),
            }
        }

        if !external.is_empty() {
            if let Err(err) = self.dispatcher.dispatch(external).await {
                warn!(pipeline_id = id, error = %err, "effect dispatch failed");
            }
        }

        follow_ups
    }

    async fn create_downstream(
        &self,
        upstream_id: PipelineId,
        bridge_id: JobId,
        now: DateTime<Utc>,
    ) -> Vec<(PipelineId, EngineCommand)> {
        let failed = |reason: FailureReason| {
            vec![(upstream_id, EngineCommand::DownstreamFailed { bridge_id, reason })]
        };

        let record = match self.pipeline(upstream_id) {
            Ok(record) => record,
            Err(err) => {
                warn!(pipeline_id = upstream_id, error = %err, "upstream pipeline vanished");
                return Vec::new();
            }
        };
        let Some(bridge) = record.job(bridge_id) else {
            warn!(pipeline_id = upstream_id, bridge_id, "bridge vanished");
            return Vec::new();
        };

        let request =
            match downstream_pipeline_params(bridge, &record.pipeline, self.downstream.as_ref()) {
                Ok(request) => request,
                Err(err) => {
                    error!(
                        pipeline_id = upstream_id,
                        bridge = %bridge.name,
                        error = %err,
                        "bridge cannot trigger a downstream pipeline"
                    );
                    return failed(err.failure_reason());
                }
            };

        let project = request.project.path.clone();
        let downstream_id = self.store.allocate_pipeline_id();
        let iid = self.store.allocate_iid(&project);

        let created = match self
            .downstream
            .create_pipeline(request, downstream_id, iid, now)
            .await
        {
            Ok(created) => created,
            Err(err) => {
                warn!(pipeline_id = upstream_id, bridge_id, error = %err, "downstream creation failed");
                return failed(err.failure_reason());
            }
        };

        if let Err(err) = self.store.insert(created) {
            warn!(pipeline_id = upstream_id, bridge_id, error = %err, "downstream pipeline not stored");
            return failed(FailureReason::DownstreamPipelineCreationFailed);
        }

        info!(
            pipeline_id = upstream_id,
            bridge = %bridge.name,
            downstream_id,
            %project,
            "downstream pipeline created"
        );

        vec![
            (downstream_id, EngineCommand::Process),
            (
                upstream_id,
                EngineCommand::DownstreamCreated {
                    bridge_id,
                    downstream_id,
                },
            ),
        ]
    }

    fn tick_runner_queues(&self, pipeline_id: PipelineId, job_id: JobId, now: DateTime<Utc>) {
        let Ok(record) = self.pipeline(pipeline_id) else {
            return;
        };
        let Some(job) = record.job(job_id) else {
            return;
        };
        let matcher = BuildMatcher::new(job, record.pipeline.protected_ref);

        for runner in self.runners().values_mut() {
            if runner.match_build_if_online(&matcher, now) {
                let value = runner.tick_runner_queue();
                debug!(runner_id = runner.id, job_id, queue_value = value, "runner queue ticked");
            }
        }
    }

    /// React to an event from the runtime channel.
    pub async fn handle(&self, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::JobUpdated {
                pipeline_id,
                job_id,
                status,
                failure_reason,
            } => self.update_job(pipeline_id, job_id, status, failure_reason).await.map(drop),
            EngineEvent::JobPlayed { pipeline_id, job_id } => {
                self.play_job(pipeline_id, job_id).await.map(drop)
            }
            EngineEvent::JobRetried { pipeline_id, job_id } => {
                self.retry_job(pipeline_id, job_id).await.map(drop)
            }
            EngineEvent::PipelineRetried { pipeline_id } => {
                self.retry_pipeline(pipeline_id).await.map(drop)
            }
            EngineEvent::PipelineCanceled { pipeline_id } => {
                self.cancel_running(pipeline_id).await.map(drop)
            }
            EngineEvent::PipelineAutoCanceled { pipeline_id, by } => {
                self.auto_cancel_running(pipeline_id, by).await.map(drop)
            }
            EngineEvent::ScheduledTick { now } => {
                match self.enqueue_due_scheduled(now).await.into_iter().next() {
                    Some((_, err)) => Err(err),
                    None => Ok(()),
                }
            }
            EngineEvent::DownstreamFinished {
                pipeline_id,
                bridge_id,
                status,
            } => self
                .execute(
                    pipeline_id,
                    EngineCommand::InheritFromDownstream { bridge_id, status },
                )
                .await
                .map(drop),
            EngineEvent::ShutdownRequested => Ok(()),
        }
    }

    pub async fn update_job(
        &self,
        pipeline_id: PipelineId,
        job_id: JobId,
        status: Status,
        failure_reason: Option<FailureReason>,
    ) -> Result<ProcessingStep> {
        self.execute(
            pipeline_id,
            EngineCommand::UpdateJob {
                job_id,
                status,
                failure_reason,
                runner_id: None,
            },
        )
        .await
    }

    pub async fn play_job(&self, pipeline_id: PipelineId, job_id: JobId) -> Result<ProcessingStep> {
        self.execute(pipeline_id, EngineCommand::PlayJob { job_id }).await
    }

    pub async fn retry_job(&self, pipeline_id: PipelineId, job_id: JobId) -> Result<ProcessingStep> {
        self.execute(pipeline_id, EngineCommand::RetryJob { job_id }).await
    }

    pub async fn retry_pipeline(&self, pipeline_id: PipelineId) -> Result<ProcessingStep> {
        self.execute(pipeline_id, EngineCommand::RetryPipeline).await
    }

    pub async fn cancel_running(&self, pipeline_id: PipelineId) -> Result<ProcessingStep> {
        self.execute(pipeline_id, EngineCommand::CancelRunning).await
    }

    pub async fn auto_cancel_running(
        &self,
        pipeline_id: PipelineId,
        by: PipelineId,
    ) -> Result<ProcessingStep> {
        self.execute(pipeline_id, EngineCommand::AutoCancelRunning { by })
            .await
    }

    pub async fn unschedule_job(&self, pipeline_id: PipelineId, job_id: JobId) -> Result<ProcessingStep> {
        self.execute(pipeline_id, EngineCommand::UnscheduleJob { job_id })
            .await
    }

    /// Enqueue due scheduled jobs in every pipeline that has any.
    /// Enqueue scheduled jobs whose time has come, in every pipeline.
    ///
    /// A pipeline that cannot be updated does not hold up the others; its
    /// error is logged and returned with the rest.
    pub async fn enqueue_due_scheduled(&self, now: DateTime<Utc>) -> Vec<(PipelineId, EngineError)> {
        let mut failures = Vec::new();
        for id in self.store.pipeline_ids() {
            let due = match self.pipeline(id) {
                Ok(record) => record.latest_jobs().any(|job| {
                    job.status == Status::Scheduled && job.scheduled_at.is_some_and(|at| at <= now)
                }),
                Err(err) => {
                    warn!(pipeline_id = id, error = %err, "cannot load pipeline for scheduled jobs");
                    failures.push((id, err));
                    continue;
                }
            };
            if !due {
                continue;
            }
            if let Err(err) = self.execute_at(id, EngineCommand::EnqueueDueScheduled, now).await {
                warn!(pipeline_id = id, error = %err, "failed to enqueue scheduled jobs");
                failures.push((id, err));
            }
        }
        failures
    }

    /// Every pipeline is either completed or waiting for a manual action.
    pub fn is_settled(&self) -> bool {
        self.store.pipeline_ids().into_iter().all(|id| {
            self.pipeline(id)
                .map(|record| record.status().is_completed() || record.status() == Status::Manual)
                .unwrap_or(true)
        })
    }

    /// The pipeline has a pending build no registered runner can take now.
    pub fn is_stuck(&self, id: PipelineId) -> Result<bool> {
        let record = self.pipeline(id)?;
        let runners = self.runners();
        Ok(record.is_stuck(runners.values(), Utc::now()))
    }

    /// Register a runner, assigning it the next free id.
    pub fn register_runner(&self, mut runner: Runner) -> RunnerId {
        let mut runners = self.runners();
        let id = runners.keys().max().copied().unwrap_or(0) + 1;
        runner.id = id;
        info!(runner_id = id, description = %runner.description, tags = ?runner.tags, "runner registered");
        runners.insert(id, runner);
        id
    }

    pub fn runner(&self, id: RunnerId) -> Option<Runner> {
        self.runners().get(&id).cloned()
    }

    pub fn heartbeat(&self, id: RunnerId, info: HeartbeatInfo) -> Result<()> {
        let mut runners = self.runners();
        let runner = runners.get_mut(&id).ok_or(EngineError::RunnerNotFound(id))?;
        runner.heartbeat(info, Utc::now());
        Ok(())
    }

    /// Hand the oldest matching pending job to a runner, if there is one.
    ///
    /// The job is moved to `running` through the optimistic-locking loop,
    /// so two runners asking at the same time never get the same job.
    pub async fn pick_job(&self, runner_id: RunnerId) -> Result<Option<PickedJob>> {
        let now = Utc::now();
        let runner = {
            let mut runners = self.runners();
            let runner = runners
                .get_mut(&runner_id)
                .ok_or(EngineError::RunnerNotFound(runner_id))?;
            runner.contacted_at = Some(now);
            runner.clone()
        };

        let mut ids = self.store.pipeline_ids();
        ids.sort_unstable();

        for id in ids {
            let record = self.pipeline(id)?;
            let protected = record.pipeline.protected_ref;
            let candidate = record
                .latest_jobs()
                .filter(|job| job.is_runnable())
                .any(|job| runner.matches_build(&BuildMatcher::new(job, protected)));
            if !candidate {
                continue;
            }

            let step = self
                .execute_at(id, EngineCommand::PickJob { runner: runner.clone() }, now)
                .await?;
            let Some(job_id) = step
                .job_transitions
                .iter()
                .find(|t| t.to == Status::Running)
                .map(|t| t.job_id)
            else {
                continue;
            };

            let record = self.pipeline(id)?;
            let Some(job) = record.job(job_id).cloned() else {
                continue;
            };

            if let Some(stored) = self.runners().get_mut(&runner_id) {
                stored.pick_build(&BuildMatcher::new(&job, protected));
            }

            let timeout = resolve_timeout(
                job.timeout_secs,
                self.settings.build_timeout_secs,
                runner.maximum_timeout_secs,
            );
            let mut variables = scoped_variables(&job, &record.pipeline);
            variables.concat(record.pipeline.persisted_variables().iter());

            info!(runner_id, pipeline_id = id, job = %job.name, timeout = timeout.secs, "job picked");
            return Ok(Some(PickedJob {
                pipeline_id: id,
                job,
                timeout,
                variables: variables.into_vec(),
            }));
        }

        Ok(None)
    }
}
