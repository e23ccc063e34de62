#![allow(dead_code)]

use std::collections::BTreeMap;

use pipeline_engine::bridge::{TriggerConfig, TriggerStrategy};
use pipeline_engine::config::{
    ConfigFile, DownstreamProjectSection, JobConfig, RawConfigFile, RunnerSection,
};
use pipeline_engine::job::When;
use pipeline_engine::pipeline::{Pipeline, PipelineRecord};
use pipeline_engine::seed::seed_pipeline;
use pipeline_engine::types::{PipelineId, StageMode};

use crate::fixed_now;

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                stages: vec!["build".into(), "test".into(), "deploy".into()],
                ..RawConfigFile::default()
            },
        }
    }

    pub fn with_stages(mut self, stages: &[&str]) -> Self {
        self.config.stages = stages.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_job(mut self, name: &str, job: JobConfig) -> Self {
        self.config.job.insert(name.to_string(), job);
        self
    }

    pub fn with_variable(mut self, key: &str, value: &str) -> Self {
        self.config.variables.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_runner(mut self, name: &str, tags: &[&str]) -> Self {
        self.config.runner.insert(
            name.to_string(),
            RunnerSection {
                tags: tags.iter().map(|t| t.to_string()).collect(),
                ..RunnerSection::default()
            },
        );
        self
    }

    pub fn with_project(mut self, path: &str, definition: Option<&str>) -> Self {
        self.config.projects.insert(
            path.to_string(),
            DownstreamProjectSection {
                default_branch: "main".to_string(),
                definition: definition.map(String::from),
            },
        );
        self
    }

    pub fn with_protected_ref(mut self, git_ref: &str) -> Self {
        self.config.project.protected_refs.push(git_ref.to_string());
        self
    }

    pub fn with_stage_mode(mut self, mode: StageMode) -> Self {
        self.config.engine.stage_mode = mode;
        self
    }

    pub fn build_raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `JobConfig`.
pub struct JobConfigBuilder {
    job: JobConfig,
}

impl JobConfigBuilder {
    pub fn new(stage: &str) -> Self {
        Self {
            job: JobConfig {
                stage: stage.to_string(),
                when: When::OnSuccess,
                allow_failure: false,
                needs: vec![],
                tags: vec![],
                start_in_secs: None,
                timeout_secs: None,
                variables: BTreeMap::new(),
                trigger: None,
                duration_ms: None,
            },
        }
    }

    pub fn when(mut self, when: When) -> Self {
        self.job.when = when;
        self
    }

    pub fn manual(self) -> Self {
        self.when(When::Manual)
    }

    pub fn delayed(mut self, start_in_secs: u64) -> Self {
        self.job.when = When::Delayed;
        self.job.start_in_secs = Some(start_in_secs);
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.job.allow_failure = true;
        self
    }

    pub fn needs(mut self, dep: &str) -> Self {
        self.job.needs.push(dep.to_string());
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.job.tags.push(tag.to_string());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.job.timeout_secs = Some(secs);
        self
    }

    pub fn variable(mut self, key: &str, value: &str) -> Self {
        self.job.variables.insert(key.to_string(), value.to_string());
        self
    }

    pub fn trigger(mut self, trigger: TriggerConfig) -> Self {
        self.job.trigger = Some(trigger);
        self
    }

    pub fn build(self) -> JobConfig {
        self.job
    }
}

/// Trigger for a child pipeline built from `include`.
pub fn child_trigger(include: &str, depend: bool) -> TriggerConfig {
    TriggerConfig {
        include: vec![include.to_string()],
        strategy: depend.then_some(TriggerStrategy::Depend),
        ..TriggerConfig::default()
    }
}

/// Trigger for a pipeline in another project.
pub fn project_trigger(project: &str, depend: bool) -> TriggerConfig {
    TriggerConfig {
        project: Some(project.to_string()),
        strategy: depend.then_some(TriggerStrategy::Depend),
        ..TriggerConfig::default()
    }
}

/// A seeded, not yet processed record for `cfg` on `main`.
pub fn seeded(cfg: &ConfigFile, id: PipelineId) -> PipelineRecord {
    seeded_on(cfg, id, "main")
}

pub fn seeded_on(cfg: &ConfigFile, id: PipelineId, git_ref: &str) -> PipelineRecord {
    let header = Pipeline::new(
        id,
        cfg.project.path.clone(),
        git_ref,
        "0000000000000000000000000000000000000000",
        fixed_now(),
    );
    seed_pipeline(cfg, header, fixed_now())
}
