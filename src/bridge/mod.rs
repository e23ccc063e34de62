// src/bridge/mod.rs

//! Bridge jobs: jobs that trigger a downstream pipeline instead of running a
//! script.
//!
//! - A bridge with `include` triggers a child pipeline in the same project.
//! - A bridge with `project` triggers a pipeline in another project.
//! - [`variables`] handles the variables forwarded downstream.
//!
//! Building the request is pure. Creating the pipeline is the job of a
//! `DownstreamService` (see `exec::downstream`).

pub mod variables;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::TransitionError;
use crate::job::machine::{self as job_machine, JobEvent, JobTransition};
use crate::job::{FailureReason, Job};
use crate::pipeline::{Pipeline, UpstreamLink};
use crate::status::Status;
use crate::types::{JobId, Source};
use variables::{Variable, VariableCollection, dedup_last_wins, expand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStrategy {
    /// The bridge mirrors the final status of the downstream pipeline.
    Depend,
}

/// Which variables a bridge passes downstream. Unset fields use the
/// defaults: yaml variables are forwarded, pipeline variables are not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ForwardConfig {
    pub yaml_variables: Option<bool>,
    pub pipeline_variables: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TriggerConfig {
    /// Full path of the downstream project (cross-project pipelines).
    pub project: Option<String>,
    /// Downstream ref; may reference variables.
    pub branch: Option<String>,
    /// Config files for a child pipeline.
    #[serde(default)]
    pub include: Vec<String>,
    pub strategy: Option<TriggerStrategy>,
    #[serde(default)]
    pub forward: ForwardConfig,
}

impl TriggerConfig {
    pub fn triggers_child_pipeline(&self) -> bool {
        !self.include.is_empty()
    }

    pub fn triggers_cross_project_pipeline(&self) -> bool {
        self.project.as_deref().is_some_and(|p| !p.is_empty())
    }

    pub fn triggers_downstream_pipeline(&self) -> bool {
        self.triggers_child_pipeline() || self.triggers_cross_project_pipeline()
    }

    pub fn is_dependent(&self) -> bool {
        self.strategy == Some(TriggerStrategy::Depend)
    }

    pub fn forward_yaml_variables(&self) -> bool {
        self.forward.yaml_variables.unwrap_or(true)
    }

    pub fn forward_pipeline_variables(&self) -> bool {
        self.forward.pipeline_variables.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub path: String,
    pub default_branch: String,
}

impl Project {
    pub fn new(path: impl Into<String>, default_branch: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            default_branch: default_branch.into(),
        }
    }
}

/// Looks projects up by full path.
pub trait ProjectResolver: Send + Sync {
    fn find_by_full_path(&self, path: &str) -> Option<Project>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRevision {
    pub git_ref: String,
    pub checkout_sha: Option<String>,
    pub before: Option<String>,
    pub source_sha: Option<String>,
    pub target_sha: Option<String>,
    pub variables: Vec<Variable>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteParams {
    pub ignore_skip_ci: bool,
    pub bridge_id: JobId,
    pub merge_request_id: Option<u64>,
    /// Config files for a child pipeline; empty for cross-project.
    pub includes: Vec<String>,
}

/// Everything a downstream service needs to create the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePipelineRequest {
    pub project: Project,
    pub source: Source,
    pub target_revision: TargetRevision,
    pub execute_params: ExecuteParams,
    pub upstream: UpstreamLink,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("job {0} is not a bridge")]
    NotABridge(JobId),

    #[error("bridge {bridge_id} has neither a child include nor a downstream project")]
    InvalidBridgeType { bridge_id: JobId },

    #[error("downstream project `{path}` not found")]
    DownstreamProjectNotFound { path: String },

    #[error("downstream service failed ({status}): {message}")]
    Service { status: u16, message: String },
}

impl BridgeError {
    /// Failure reason recorded on the bridge when this error drops it.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            BridgeError::NotABridge(_) | BridgeError::InvalidBridgeType { .. } => {
                FailureReason::InvalidBridgeTrigger
            }
            BridgeError::DownstreamProjectNotFound { .. } => {
                FailureReason::DownstreamBridgeProjectNotFound
            }
            BridgeError::Service { status: 404, .. } => {
                FailureReason::DownstreamBridgeProjectNotFound
            }
            BridgeError::Service { status: 403, .. } => {
                FailureReason::InsufficientBridgePermissions
            }
            BridgeError::Service { .. } => FailureReason::DownstreamPipelineCreationFailed,
        }
    }
}

fn trigger_of(bridge: &Job) -> Result<&TriggerConfig, BridgeError> {
    bridge.trigger().ok_or(BridgeError::NotABridge(bridge.id))
}

/// Variables visible to the bridge itself.
pub fn scoped_variables(bridge: &Job, pipeline: &Pipeline) -> VariableCollection {
    let mut vars = VariableCollection::new();
    vars.append("CI_JOB_NAME", bridge.name.as_str())
        .append("CI_JOB_STAGE", bridge.stage.as_str())
        .concat(pipeline.predefined_variables().iter())
        .concat(bridge.yaml_variables.iter())
        .concat(pipeline.variables.iter());
    vars
}

fn expansion_context(bridge: &Job, pipeline: &Pipeline) -> VariableCollection {
    let mut vars = scoped_variables(bridge, pipeline);
    vars.concat(pipeline.persisted_variables().iter());
    vars
}

/// The trigger `branch` with variables expanded.
pub fn target_ref(bridge: &Job, pipeline: &Pipeline) -> Option<String> {
    let branch = bridge.trigger()?.branch.as_deref()?;
    let vars = scoped_variables(bridge, pipeline);
    Some(expand(branch, &vars.to_lookup()))
}

/// Variables passed to the downstream pipeline: yaml variables first, then
/// pipeline variables, each expanded. For a repeated key the last one wins.
pub fn downstream_variables(bridge: &Job, pipeline: &Pipeline) -> Vec<Variable> {
    let Some(trigger) = bridge.trigger() else {
        return Vec::new();
    };
    let context = expansion_context(bridge, pipeline);
    let lookup = context.to_lookup();
    let expanded = |v: &Variable| Variable::new(v.key.clone(), expand(&v.value, &lookup));

    let mut out = Vec::new();
    if trigger.forward_yaml_variables() {
        out.extend(bridge.yaml_variables.iter().map(expanded));
    }
    if trigger.forward_pipeline_variables() {
        out.extend(pipeline.variables.iter().map(expanded));
    }
    dedup_last_wins(out)
}

/// Build the create-pipeline request for `bridge`.
pub fn downstream_pipeline_params<R>(
    bridge: &Job,
    pipeline: &Pipeline,
    resolver: &R,
) -> Result<CreatePipelineRequest, BridgeError>
where
    R: ProjectResolver + ?Sized,
{
    let trigger = trigger_of(bridge)?;
    let upstream = UpstreamLink {
        pipeline_id: pipeline.id,
        bridge_id: bridge.id,
    };

    if trigger.triggers_child_pipeline() {
        let project = resolver
            .find_by_full_path(&pipeline.project)
            .unwrap_or_else(|| Project::new(pipeline.project.clone(), pipeline.git_ref.clone()));

        return Ok(CreatePipelineRequest {
            project,
            source: Source::ParentPipeline,
            target_revision: TargetRevision {
                git_ref: pipeline.git_ref.clone(),
                checkout_sha: Some(pipeline.sha.clone()),
                before: pipeline.before_sha.clone(),
                source_sha: pipeline.source_sha.clone(),
                target_sha: pipeline.target_sha.clone(),
                variables: downstream_variables(bridge, pipeline),
            },
            execute_params: ExecuteParams {
                ignore_skip_ci: true,
                bridge_id: bridge.id,
                merge_request_id: pipeline.merge_request_id,
                includes: trigger.include.clone(),
            },
            upstream,
        });
    }

    if let Some(path) = trigger.project.as_deref().filter(|p| !p.is_empty()) {
        let project = resolver
            .find_by_full_path(path)
            .ok_or_else(|| BridgeError::DownstreamProjectNotFound {
                path: path.to_string(),
            })?;
        let git_ref = target_ref(bridge, pipeline).unwrap_or_else(|| project.default_branch.clone());

        return Ok(CreatePipelineRequest {
            project,
            source: Source::Pipeline,
            target_revision: TargetRevision {
                git_ref,
                checkout_sha: None,
                before: None,
                source_sha: None,
                target_sha: None,
                variables: downstream_variables(bridge, pipeline),
            },
            execute_params: ExecuteParams {
                ignore_skip_ci: true,
                bridge_id: bridge.id,
                merge_request_id: None,
                includes: Vec::new(),
            },
            upstream,
        });
    }

    Err(BridgeError::InvalidBridgeType {
        bridge_id: bridge.id,
    })
}

/// Mirror a finished downstream pipeline onto its bridge.
pub fn inherit_status_from_downstream(
    bridge: &mut Job,
    downstream_status: Status,
    now: DateTime<Utc>,
) -> Result<Option<JobTransition>, TransitionError> {
    let event = match downstream_status {
        Status::Success => JobEvent::Succeed,
        Status::Failed | Status::Canceled | Status::Skipped => JobEvent::Drop {
            reason: FailureReason::DownstreamPipelineFailed,
        },
        Status::Created
        | Status::Preparing
        | Status::Pending
        | Status::Running
        | Status::Manual
        | Status::Scheduled => return Ok(None),
    };
    job_machine::transition(bridge, event, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Projects(HashMap<String, Project>);

    impl ProjectResolver for Projects {
        fn find_by_full_path(&self, path: &str) -> Option<Project> {
            self.0.get(path).cloned()
        }
    }

    fn projects() -> Projects {
        let mut map = HashMap::new();
        map.insert("group/app".into(), Project::new("group/app", "main"));
        map.insert("group/deployer".into(), Project::new("group/deployer", "stable"));
        Projects(map)
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn parent() -> Pipeline {
        let mut p = Pipeline::new(3, "group/app", "feature", "abc123", now());
        p.before_sha = Some("000".into());
        p.merge_request_id = Some(12);
        p.variables = vec![Variable::new("DEPLOY_ENV", "prod")];
        p
    }

    fn bridge(trigger: TriggerConfig) -> Job {
        let mut job = Job::bridge(8, 3, "trigger", "deploy", 2, trigger, now());
        job.yaml_variables = vec![
            Variable::new("TARGET", "$CI_COMMIT_REF_NAME"),
            Variable::new("PIPELINE", "${CI_PIPELINE_ID}"),
        ];
        job
    }

    #[test]
    fn child_pipeline_copies_parent_revision() {
        let job = bridge(TriggerConfig {
            include: vec!["child.toml".into()],
            ..Default::default()
        });
        let req = downstream_pipeline_params(&job, &parent(), &projects()).unwrap();

        assert_eq!(req.source, Source::ParentPipeline);
        assert_eq!(req.project.path, "group/app");
        assert_eq!(req.target_revision.git_ref, "feature");
        assert_eq!(req.target_revision.checkout_sha.as_deref(), Some("abc123"));
        assert_eq!(req.target_revision.before.as_deref(), Some("000"));
        assert_eq!(req.execute_params.merge_request_id, Some(12));
        assert_eq!(req.execute_params.includes, vec!["child.toml".to_string()]);
        assert!(req.execute_params.ignore_skip_ci);
        assert_eq!(req.upstream, UpstreamLink { pipeline_id: 3, bridge_id: 8 });
    }

    #[test]
    fn cross_project_uses_expanded_branch_or_default() {
        let mut job = bridge(TriggerConfig {
            project: Some("group/deployer".into()),
            branch: Some("release/$DEPLOY_ENV".into()),
            ..Default::default()
        });
        let req = downstream_pipeline_params(&job, &parent(), &projects()).unwrap();
        assert_eq!(req.source, Source::Pipeline);
        assert_eq!(req.target_revision.git_ref, "release/prod");
        assert_eq!(req.execute_params.merge_request_id, None);

        if let crate::job::JobKind::Bridge { trigger, .. } = &mut job.kind {
            trigger.branch = None;
        }
        let req = downstream_pipeline_params(&job, &parent(), &projects()).unwrap();
        assert_eq!(req.target_revision.git_ref, "stable");
    }

    #[test]
    fn unknown_project_is_reported() {
        let job = bridge(TriggerConfig {
            project: Some("nope/nope".into()),
            ..Default::default()
        });
        let err = downstream_pipeline_params(&job, &parent(), &projects()).unwrap_err();
        assert_eq!(err.failure_reason(), FailureReason::DownstreamBridgeProjectNotFound);
    }

    #[test]
    fn bridge_without_target_is_invalid() {
        let job = bridge(TriggerConfig::default());
        let err = downstream_pipeline_params(&job, &parent(), &projects()).unwrap_err();
        assert_eq!(err, BridgeError::InvalidBridgeType { bridge_id: 8 });
        assert_eq!(err.failure_reason(), FailureReason::InvalidBridgeTrigger);
    }

    #[test]
    fn yaml_variables_are_forwarded_and_expanded_by_default() {
        let job = bridge(TriggerConfig {
            include: vec!["child.toml".into()],
            ..Default::default()
        });
        let vars = downstream_variables(&job, &parent());
        assert_eq!(
            vars,
            vec![
                Variable::new("TARGET", "feature"),
                Variable::new("PIPELINE", "3"),
            ]
        );
    }

    #[test]
    fn pipeline_variables_need_opt_in_and_win_on_conflict() {
        let mut job = bridge(TriggerConfig {
            include: vec!["child.toml".into()],
            forward: ForwardConfig {
                yaml_variables: Some(true),
                pipeline_variables: Some(true),
            },
            ..Default::default()
        });
        job.yaml_variables.push(Variable::new("DEPLOY_ENV", "staging"));

        let vars = downstream_variables(&job, &parent());
        let deploy: Vec<&Variable> = vars.iter().filter(|v| v.key == "DEPLOY_ENV").collect();
        assert_eq!(deploy, vec![&Variable::new("DEPLOY_ENV", "prod")]);
        assert_eq!(vars.last().map(|v| v.key.as_str()), Some("DEPLOY_ENV"));
    }

    #[test]
    fn yaml_variables_can_be_withheld() {
        let job = bridge(TriggerConfig {
            include: vec!["child.toml".into()],
            forward: ForwardConfig {
                yaml_variables: Some(false),
                pipeline_variables: None,
            },
            ..Default::default()
        });
        assert!(downstream_variables(&job, &parent()).is_empty());
    }

    #[test]
    fn service_errors_map_to_failure_reasons() {
        let reason = |status| {
            BridgeError::Service {
                status,
                message: String::new(),
            }
            .failure_reason()
        };
        assert_eq!(reason(404), FailureReason::DownstreamBridgeProjectNotFound);
        assert_eq!(reason(403), FailureReason::InsufficientBridgePermissions);
        assert_eq!(reason(500), FailureReason::DownstreamPipelineCreationFailed);
    }

    #[test]
    fn bridge_inherits_final_downstream_status() {
        let mut job = bridge(TriggerConfig::default());
        job.status = Status::Running;
        assert!(inherit_status_from_downstream(&mut job, Status::Pending, now())
            .unwrap()
            .is_none());

        inherit_status_from_downstream(&mut job, Status::Canceled, now()).unwrap();
        assert_eq!(job.status, Status::Failed);
        assert_eq!(job.failure_reason, Some(FailureReason::DownstreamPipelineFailed));

        let mut job = bridge(TriggerConfig::default());
        job.status = Status::Running;
        inherit_status_from_downstream(&mut job, Status::Success, now()).unwrap();
        assert_eq!(job.status, Status::Success);
    }
}
