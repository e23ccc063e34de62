use std::str::FromStr;
use serde::{Deserialize, Serialize};

pub type PipelineId = u64;
pub type JobId = u64;
pub type RunnerId = u64;

/// How a pipeline's ordered stages are computed once it has completed.
///
/// - `Persisted`: use the stage rows stored on the pipeline (default). Empty
///   stages keep their row and report `skipped`.
/// - `Legacy`: derive stages on the fly from the jobs' `stage`/`stage_idx`,
///   ordered by the highest `stage_idx` seen per name. Empty stages do not
///   exist in this view.
///
/// Pipelines that are still running always use the legacy view, since stage
/// rows may lag behind concurrent job updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageMode {
    Persisted,
    Legacy,
}

impl Default for StageMode {
    fn default() -> Self {
        StageMode::Persisted
    }
}

impl FromStr for StageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "persisted" => Ok(StageMode::Persisted),
            "legacy" => Ok(StageMode::Legacy),
            other => Err(format!(
                "invalid stage_mode: {other} (expected \"persisted\" or \"legacy\")"
            )),
        }
    }
}

/// What caused a pipeline to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Push,
    Web,
    Trigger,
    Schedule,
    Api,
    External,
    /// Cross-project pipeline triggered by a bridge.
    Pipeline,
    Chat,
    MergeRequestEvent,
    /// Child pipeline triggered by a bridge in the same project.
    ParentPipeline,
}

impl Default for Source {
    fn default() -> Self {
        Source::Push
    }
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Push => "push",
            Source::Web => "web",
            Source::Trigger => "trigger",
            Source::Schedule => "schedule",
            Source::Api => "api",
            Source::External => "external",
            Source::Pipeline => "pipeline",
            Source::Chat => "chat",
            Source::MergeRequestEvent => "merge_request_event",
            Source::ParentPipeline => "parent_pipeline",
        }
    }
}

/// Where the pipeline's configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    RepositorySource,
    AutoDevopsSource,
    ParameterSource,
    BridgeSource,
    UnknownSource,
}

impl Default for ConfigSource {
    fn default() -> Self {
        ConfigSource::RepositorySource
    }
}
