// src/config/model.rs

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::bridge::TriggerConfig;
use crate::job::When;
use crate::types::StageMode;

/// Top-level pipeline definition as read from a TOML file, before
/// validation.
///
/// ```toml
/// stages = ["build", "test", "deploy"]
///
/// [engine]
/// stage_mode = "persisted"
/// optimistic_lock_attempts = 5
///
/// [project]
/// path = "group/app"
/// default_branch = "main"
///
/// [variables]
/// DEPLOY_ENV = "staging"
///
/// [job.compile]
/// stage = "build"
///
/// [job.rspec]
/// stage = "test"
/// needs = ["compile"]
///
/// [job.deploy]
/// stage = "deploy"
/// when = "manual"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub project: ProjectSection,

    /// Other projects bridges may trigger, keyed by full path.
    #[serde(default)]
    pub projects: BTreeMap<String, DownstreamProjectSection>,

    /// Stage names in execution order.
    #[serde(default = "default_stages")]
    pub stages: Vec<String>,

    /// Pipeline variables.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    /// Simulated runners used by the CLI, keyed by description.
    #[serde(default)]
    pub runner: BTreeMap<String, RunnerSection>,

    /// All jobs from `[job.<name>]`.
    #[serde(default)]
    pub job: BTreeMap<String, JobConfig>,
}

/// Validated pipeline definition. Only constructed through
/// `TryFrom<RawConfigFile>` (see `config::validate`).
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineSection,
    pub project: ProjectSection,
    pub projects: BTreeMap<String, DownstreamProjectSection>,
    pub stages: Vec<String>,
    pub variables: BTreeMap<String, String>,
    pub runner: BTreeMap<String, RunnerSection>,
    pub job: BTreeMap<String, JobConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            engine: raw.engine,
            project: raw.project,
            projects: raw.projects,
            stages: raw.stages,
            variables: raw.variables,
            runner: raw.runner,
            job: raw.job,
        }
    }

    /// Position of a stage in `stages`.
    pub fn stage_index(&self, stage: &str) -> Option<u32> {
        self.stages
            .iter()
            .position(|s| s == stage)
            .map(|idx| idx as u32)
    }
}

fn default_stages() -> Vec<String> {
    ["build", "test", "deploy"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    #[serde(default)]
    pub stage_mode: StageMode,

    /// Attempts per optimistic-locking write before giving up.
    #[serde(default = "default_optimistic_lock_attempts")]
    pub optimistic_lock_attempts: u32,

    /// Backoff after the first conflict; doubles per attempt.
    #[serde(default = "default_optimistic_lock_backoff_ms")]
    pub optimistic_lock_backoff_ms: u64,

    /// Capacity of the runtime event channel.
    #[serde(default = "default_event_queue_length")]
    pub event_queue_length: usize,
}

fn default_optimistic_lock_attempts() -> u32 {
    5
}

fn default_optimistic_lock_backoff_ms() -> u64 {
    10
}

fn default_event_queue_length() -> usize {
    256
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            stage_mode: StageMode::default(),
            optimistic_lock_attempts: default_optimistic_lock_attempts(),
            optimistic_lock_backoff_ms: default_optimistic_lock_backoff_ms(),
            event_queue_length: default_event_queue_length(),
        }
    }
}

/// `[project]` section: the project the pipeline runs in.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectSection {
    #[serde(default = "default_project_path")]
    pub path: String,

    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// Job timeout used when a job sets none.
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,

    /// Pipelines come from Auto DevOps rather than a repository file.
    #[serde(default)]
    pub auto_devops: bool,

    /// Refs whose pipelines count as protected.
    #[serde(default)]
    pub protected_refs: Vec<String>,
}

fn default_project_path() -> String {
    "local/project".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_build_timeout_secs() -> u64 {
    3600
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            path: default_project_path(),
            default_branch: default_branch(),
            build_timeout_secs: default_build_timeout_secs(),
            auto_devops: false,
            protected_refs: Vec::new(),
        }
    }
}

impl ProjectSection {
    pub fn is_protected_ref(&self, git_ref: &str) -> bool {
        self.protected_refs.iter().any(|r| r == git_ref)
    }
}

/// `[projects."<path>"]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DownstreamProjectSection {
    #[serde(default = "default_branch")]
    pub default_branch: String,

    /// Pipeline definition for the project, relative to this file.
    #[serde(default)]
    pub definition: Option<String>,
}

/// `[runner.<description>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RunnerSection {
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub run_untagged: Option<bool>,

    /// Only take jobs on protected refs.
    #[serde(default)]
    pub protected: bool,

    #[serde(default)]
    pub maximum_timeout_secs: Option<u64>,
}

impl RunnerSection {
    /// Runners without tags pick untagged jobs unless told otherwise.
    pub fn effective_run_untagged(&self) -> bool {
        self.run_untagged.unwrap_or(true)
    }
}

/// `[job.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    #[serde(default = "default_job_stage")]
    pub stage: String,

    #[serde(default)]
    pub when: When,

    #[serde(default)]
    pub allow_failure: bool,

    /// Jobs this one waits for instead of the whole previous stage.
    #[serde(default)]
    pub needs: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Required for `when = "delayed"`.
    #[serde(default)]
    pub start_in_secs: Option<u64>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    /// Makes the job a bridge.
    #[serde(default)]
    pub trigger: Option<TriggerConfig>,

    /// How long the simulated runner takes to run the job.
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

fn default_job_stage() -> String {
    "test".to_string()
}
