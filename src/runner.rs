// src/runner.rs

//! Runners: the agents that pick up and execute builds.
//!
//! The engine only needs the parts of a runner that decide which jobs it may
//! take (tags, protection level, active flag), its contact bookkeeping and
//! the queue value runners poll to notice new work.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::job::Job;
use crate::types::RunnerId;

/// A runner is online if it made contact within this window.
pub const ONLINE_CONTACT_TIMEOUT_SECS: i64 = 2 * 60 * 60;

/// A runner is stale if neither creation nor last contact is more recent
/// than this.
pub const STALE_TIMEOUT_DAYS: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerType {
    #[default]
    InstanceType,
    GroupType,
    ProjectType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    #[default]
    NotProtected,
    /// Only runs jobs on protected refs.
    RefProtected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutorType {
    #[default]
    Unknown,
    Custom,
    Shell,
    Docker,
    DockerWindows,
    DockerSsh,
    Ssh,
    Parallels,
    Virtualbox,
    DockerMachine,
    DockerSshMachine,
    Kubernetes,
}

impl ExecutorType {
    /// Map the executor name a runner reports. Unrecognized names are
    /// `Unknown`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "custom" => ExecutorType::Custom,
            "shell" => ExecutorType::Shell,
            "docker" => ExecutorType::Docker,
            "docker-windows" => ExecutorType::DockerWindows,
            "docker-ssh" => ExecutorType::DockerSsh,
            "ssh" => ExecutorType::Ssh,
            "parallels" => ExecutorType::Parallels,
            "virtualbox" => ExecutorType::Virtualbox,
            "docker+machine" => ExecutorType::DockerMachine,
            "docker-ssh+machine" => ExecutorType::DockerSshMachine,
            "kubernetes" => ExecutorType::Kubernetes,
            _ => ExecutorType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Online,
    Offline,
    NeverContacted,
    Stale,
}

/// Values a runner reports when it contacts the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatInfo {
    pub version: Option<String>,
    pub revision: Option<String>,
    pub platform: Option<String>,
    pub architecture: Option<String>,
    pub executor: Option<String>,
}

/// What a runner needs to know about a job to decide whether to take it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildMatcher<'a> {
    pub tags: &'a [String],
    pub protected: bool,
}

impl<'a> BuildMatcher<'a> {
    pub fn new(job: &'a Job, protected_ref: bool) -> Self {
        Self {
            tags: &job.tags,
            protected: protected_ref,
        }
    }

    pub fn has_tags(&self) -> bool {
        !self.tags.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Runner {
    pub id: RunnerId,
    pub description: String,
    pub runner_type: RunnerType,
    pub tags: Vec<String>,
    pub run_untagged: bool,
    pub locked: bool,
    pub active: bool,
    pub access_level: AccessLevel,
    pub maximum_timeout_secs: Option<u64>,
    pub public_projects_minutes_cost_factor: f64,
    pub private_projects_minutes_cost_factor: f64,
    pub created_at: DateTime<Utc>,
    pub contacted_at: Option<DateTime<Utc>>,
    pub version: Option<String>,
    pub revision: Option<String>,
    pub platform: Option<String>,
    pub architecture: Option<String>,
    pub executor_type: ExecutorType,
    /// Bumped whenever a job this runner could take becomes pending.
    pub queue_value: u64,
}

impl Runner {
    pub fn new(id: RunnerId, description: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            description: description.into(),
            runner_type: RunnerType::default(),
            tags: Vec::new(),
            run_untagged: true,
            locked: false,
            active: true,
            access_level: AccessLevel::default(),
            maximum_timeout_secs: None,
            public_projects_minutes_cost_factor: 0.0,
            private_projects_minutes_cost_factor: 1.0,
            created_at: now,
            contacted_at: None,
            version: None,
            revision: None,
            platform: None,
            architecture: None,
            executor_type: ExecutorType::Unknown,
            queue_value: 0,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_tags(&self) -> bool {
        !self.tags.is_empty()
    }

    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        self.contacted_at
            .is_some_and(|at| at > now - Duration::seconds(ONLINE_CONTACT_TIMEOUT_SECS))
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let last = match self.contacted_at {
            Some(contacted) => contacted.max(self.created_at),
            None => self.created_at,
        };
        last < now - Duration::days(STALE_TIMEOUT_DAYS)
    }

    pub fn status(&self, now: DateTime<Utc>) -> RunnerStatus {
        if self.is_stale(now) {
            RunnerStatus::Stale
        } else if self.contacted_at.is_none() {
            RunnerStatus::NeverContacted
        } else if self.is_online(now) {
            RunnerStatus::Online
        } else {
            RunnerStatus::Offline
        }
    }

    fn accepts_tags(&self, build: &BuildMatcher<'_>) -> bool {
        (self.run_untagged || build.has_tags())
            && build.tags.iter().all(|tag| self.tags.contains(tag))
    }

    pub fn matches_build(&self, build: &BuildMatcher<'_>) -> bool {
        if !self.active {
            return false;
        }
        if self.access_level == AccessLevel::RefProtected && !build.protected {
            return false;
        }
        self.accepts_tags(build)
    }

    pub fn match_build_if_online(&self, build: &BuildMatcher<'_>, now: DateTime<Utc>) -> bool {
        self.is_online(now) && self.matches_build(build)
    }

    pub fn tick_runner_queue(&mut self) -> u64 {
        self.queue_value += 1;
        self.queue_value
    }

    /// Tick the queue when the job is one this runner could take.
    pub fn pick_build(&mut self, build: &BuildMatcher<'_>) -> bool {
        let matched = self.matches_build(build);
        if matched {
            self.tick_runner_queue();
        }
        matched
    }

    pub fn is_queue_value_latest(&self, value: u64) -> bool {
        self.queue_value == value
    }

    pub fn heartbeat(&mut self, info: HeartbeatInfo, now: DateTime<Utc>) {
        self.version = info.version.or(self.version.take());
        self.revision = info.revision.or(self.revision.take());
        self.platform = info.platform.or(self.platform.take());
        self.architecture = info.architecture.or(self.architecture.take());
        self.executor_type = info
            .executor
            .as_deref()
            .map(ExecutorType::from_name)
            .unwrap_or(ExecutorType::Unknown);
        self.contacted_at = Some(now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutSource {
    Job,
    Project,
    Runner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTimeout {
    pub secs: u64,
    pub source: TimeoutSource,
}

/// Effective timeout for a job on a runner. The runner limit applies only
/// when strictly smaller than the job (or project) timeout.
pub fn resolve_timeout(
    job_timeout_secs: Option<u64>,
    project_timeout_secs: u64,
    runner_maximum_secs: Option<u64>,
) -> ResolvedTimeout {
    let base = match job_timeout_secs {
        Some(secs) => ResolvedTimeout {
            secs,
            source: TimeoutSource::Job,
        },
        None => ResolvedTimeout {
            secs: project_timeout_secs,
            source: TimeoutSource::Project,
        },
    };

    match runner_maximum_secs {
        Some(max) if max < base.secs => ResolvedTimeout {
            secs: max,
            source: TimeoutSource::Runner,
        },
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn job_with_tags(tags: &[&str]) -> Job {
        let mut job = Job::build(1, 1, "rspec", "test", 1, now());
        job.tags = tags.iter().map(|t| t.to_string()).collect();
        job
    }

    #[test]
    fn runner_needs_every_job_tag() {
        let runner = Runner::new(1, "docker", now()).with_tags(["docker", "linux"]);
        let job = job_with_tags(&["docker"]);
        assert!(runner.matches_build(&BuildMatcher::new(&job, false)));

        let job = job_with_tags(&["docker", "gpu"]);
        assert!(!runner.matches_build(&BuildMatcher::new(&job, false)));
    }

    #[test]
    fn untagged_jobs_need_run_untagged() {
        let mut runner = Runner::new(1, "r", now()).with_tags(["docker"]);
        let job = job_with_tags(&[]);
        assert!(runner.matches_build(&BuildMatcher::new(&job, false)));
        runner.run_untagged = false;
        assert!(!runner.matches_build(&BuildMatcher::new(&job, false)));
    }

    #[test]
    fn protected_runner_only_takes_protected_refs() {
        let mut runner = Runner::new(1, "r", now());
        runner.access_level = AccessLevel::RefProtected;
        let job = job_with_tags(&[]);
        assert!(!runner.matches_build(&BuildMatcher::new(&job, false)));
        assert!(runner.matches_build(&BuildMatcher::new(&job, true)));
    }

    #[test]
    fn paused_runner_matches_nothing() {
        let mut runner = Runner::new(1, "r", now());
        runner.active = false;
        let job = job_with_tags(&[]);
        assert!(!runner.matches_build(&BuildMatcher::new(&job, false)));
    }

    #[test]
    fn status_follows_contact_time() {
        let mut runner = Runner::new(1, "r", now());
        assert_eq!(runner.status(now()), RunnerStatus::NeverContacted);

        runner.heartbeat(
            HeartbeatInfo {
                version: Some("15.0.0".into()),
                executor: Some("docker+machine".into()),
                ..Default::default()
            },
            now(),
        );
        assert_eq!(runner.status(now() + Duration::minutes(30)), RunnerStatus::Online);
        assert_eq!(runner.status(now() + Duration::hours(3)), RunnerStatus::Offline);
        assert_eq!(runner.status(now() + Duration::days(91)), RunnerStatus::Stale);
        assert_eq!(runner.version.as_deref(), Some("15.0.0"));
        assert_eq!(runner.executor_type, ExecutorType::DockerMachine);
    }

    #[test]
    fn pick_build_ticks_queue_only_on_match() {
        let mut runner = Runner::new(1, "r", now()).with_tags(["docker"]);
        let value = runner.queue_value;
        assert!(!runner.pick_build(&BuildMatcher::new(&job_with_tags(&["gpu"]), false)));
        assert!(runner.is_queue_value_latest(value));
        assert!(runner.pick_build(&BuildMatcher::new(&job_with_tags(&["docker"]), false)));
        assert!(!runner.is_queue_value_latest(value));
    }

    #[test]
    fn timeout_ties_keep_the_job_source() {
        assert_eq!(
            resolve_timeout(Some(600), 3600, Some(600)),
            ResolvedTimeout {
                secs: 600,
                source: TimeoutSource::Job
            }
        );
        assert_eq!(
            resolve_timeout(None, 3600, Some(1200)),
            ResolvedTimeout {
                secs: 1200,
                source: TimeoutSource::Runner
            }
        );
        assert_eq!(
            resolve_timeout(None, 3600, None).source,
            TimeoutSource::Project
        );
    }
}
