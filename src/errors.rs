// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::bridge::BridgeError;
use crate::status::Status;
use crate::store::StoreError;
use crate::types::{JobId, PipelineId, RunnerId};

/// Which state machine rejected an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Job(JobId),
    Pipeline(PipelineId),
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::Job(id) => write!(f, "job {id}"),
            Subject::Pipeline(id) => write!(f, "pipeline {id}"),
        }
    }
}

/// An event fired from a state it is not allowed from.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot {event} {subject} from `{from}`")]
pub struct TransitionError {
    pub subject: Subject,
    pub event: &'static str,
    pub from: Status,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Cycle detected in job needs: {0}")]
    NeedsCycle(String),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(PipelineId),

    #[error("Job {job} not found in pipeline {pipeline}")]
    JobNotFound { pipeline: PipelineId, job: JobId },

    #[error("Runner not found: {0}")]
    RunnerNotFound(RunnerId),

    #[error("Unknown status `{0}`")]
    UnknownStatus(String),

    #[error("Job {0} is not retryable")]
    NotRetryable(JobId),

    #[error("Job {0} is not playable")]
    NotPlayable(JobId),

    #[error(
        "optimistic lock retries exhausted for pipeline {pipeline} after {attempts} attempts"
    )]
    LockRetriesExhausted { pipeline: PipelineId, attempts: u32 },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, EngineError>;
