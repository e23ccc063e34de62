// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{EngineError, Result};
use crate::job::When;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = EngineError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

/// Check a definition without consuming it.
pub fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_engine_config(cfg)?;
    validate_stages(cfg)?;
    validate_runners(cfg)?;
    validate_jobs(cfg)?;
    validate_needs(cfg)?;
    validate_needs_graph(cfg)?;
    Ok(())
}

fn config_error(msg: impl Into<String>) -> EngineError {
    EngineError::ConfigError(msg.into())
}

fn validate_engine_config(cfg: &RawConfigFile) -> Result<()> {
    if cfg.engine.optimistic_lock_attempts == 0 {
        return Err(config_error(
            "[engine].optimistic_lock_attempts must be >= 1 (got 0)",
        ));
    }
    if cfg.engine.event_queue_length == 0 {
        return Err(config_error(
            "[engine].event_queue_length must be >= 1 (got 0)",
        ));
    }
    Ok(())
}

fn validate_stages(cfg: &RawConfigFile) -> Result<()> {
    for (idx, stage) in cfg.stages.iter().enumerate() {
        if cfg.stages[..idx].contains(stage) {
            return Err(config_error(format!("stage '{stage}' is listed twice")));
        }
    }
    Ok(())
}

fn validate_runners(cfg: &RawConfigFile) -> Result<()> {
    for (name, runner) in cfg.runner.iter() {
        if runner.tags.is_empty() && !runner.effective_run_untagged() {
            return Err(config_error(format!(
                "runner '{name}': tags cannot be empty when the runner does not run untagged jobs"
            )));
        }
    }
    Ok(())
}

fn validate_jobs(cfg: &RawConfigFile) -> Result<()> {
    if cfg.job.is_empty() {
        return Err(config_error("definition must contain at least one job"));
    }

    for (name, job) in cfg.job.iter() {
        if !cfg.stages.contains(&job.stage) {
            return Err(config_error(format!(
                "job '{name}': chosen stage '{}' does not exist; available stages are {}",
                job.stage,
                cfg.stages.join(", ")
            )));
        }

        if job.when == When::Delayed && job.start_in_secs.is_none() {
            return Err(config_error(format!(
                "job '{name}': start_in_secs must be set when `when = \"delayed\"`"
            )));
        }

        if job.start_in_secs.is_some() && job.when != When::Delayed {
            return Err(config_error(format!(
                "job '{name}': start_in_secs is only allowed for delayed jobs"
            )));
        }

        if let Some(trigger) = &job.trigger {
            if !trigger.triggers_downstream_pipeline() {
                return Err(config_error(format!(
                    "job '{name}': trigger needs either `project` or `include`"
                )));
            }
            if trigger.triggers_child_pipeline() && trigger.triggers_cross_project_pipeline() {
                return Err(config_error(format!(
                    "job '{name}': trigger cannot set both `project` and `include`"
                )));
            }
        }
    }
    Ok(())
}

fn validate_needs(cfg: &RawConfigFile) -> Result<()> {
    let stage_idx = |stage: &str| cfg.stages.iter().position(|s| s == stage);

    for (name, job) in cfg.job.iter() {
        for need in job.needs.iter() {
            if need == name {
                return Err(config_error(format!(
                    "job '{name}' cannot need itself"
                )));
            }
            let Some(needed) = cfg.job.get(need) else {
                return Err(config_error(format!(
                    "job '{name}' has unknown dependency '{need}' in `needs`"
                )));
            };
            if stage_idx(&needed.stage) >= stage_idx(&job.stage) {
                return Err(config_error(format!(
                    "job '{name}' needs '{need}', which is not in a prior stage"
                )));
            }
        }
    }
    Ok(())
}

fn validate_needs_graph(cfg: &RawConfigFile) -> Result<()> {
    // Edge direction: need -> job.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for name in cfg.job.keys() {
        graph.add_node(name.as_str());
    }

    for (name, job) in cfg.job.iter() {
        for need in job.needs.iter() {
            graph.add_edge(need.as_str(), name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(EngineError::NeedsCycle(format!(
            "cycle detected in job needs involving job '{}'",
            cycle.node_id()
        ))),
    }
}
