// src/store/mod.rs

//! Versioned pipeline storage and the optimistic-locking retry loop.
//!
//! Every stored [`PipelineRecord`] carries a version. Writers load a record,
//! change a private copy and write it back with [`PipelineStore::compare_and_swap`],
//! which only succeeds if nobody else wrote in between. On a conflict
//! [`retry_optimistic_lock`] reloads and recomputes from scratch.

pub mod memory;

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::{EngineError, Result};
use crate::pipeline::PipelineRecord;
use crate::types::PipelineId;

pub use memory::MemoryStore;

#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("version conflict on pipeline {pipeline}: expected {expected}, found {actual}")]
    Conflict {
        pipeline: PipelineId,
        expected: u64,
        actual: u64,
    },

    #[error("pipeline {0} not found in store")]
    NotFound(PipelineId),

    #[error("pipeline {0} already exists in store")]
    AlreadyExists(PipelineId),
}

pub trait PipelineStore: Send + Sync {
    /// Reserve an id for a pipeline about to be inserted.
    fn allocate_pipeline_id(&self) -> PipelineId;

    /// Next per-project sequence number.
    fn allocate_iid(&self, project: &str) -> u64;

    fn insert(&self, record: PipelineRecord) -> std::result::Result<(), StoreError>;

    /// A copy of the stored record and its version.
    fn load(&self, id: PipelineId) -> std::result::Result<Versioned<PipelineRecord>, StoreError>;

    /// Replace the record if its version is still `expected_version`.
    /// Returns the new version.
    fn compare_and_swap(
        &self,
        id: PipelineId,
        expected_version: u64,
        record: PipelineRecord,
    ) -> std::result::Result<u64, StoreError>;

    fn pipeline_ids(&self) -> Vec<PipelineId>;
}

/// Bounds for [`retry_optimistic_lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Load the record, run `apply` on a copy and write it back, retrying the
/// whole computation on version conflicts.
///
/// `apply` must be free of side effects outside the record: it may run more
/// than once. If it leaves the record unchanged nothing is written.
pub async fn retry_optimistic_lock<S, F, T>(
    store: &S,
    id: PipelineId,
    policy: RetryPolicy,
    mut apply: F,
) -> Result<T>
where
    S: PipelineStore + ?Sized,
    F: FnMut(&mut PipelineRecord) -> Result<T>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;

        let Versioned { version, value } = store.load(id)?;
        let mut working = value.clone();
        let output = apply(&mut working)?;

        if working == value {
            return Ok(output);
        }

        match store.compare_and_swap(id, version, working) {
            Ok(new_version) => {
                debug!(pipeline_id = id, version = new_version, attempt, "record written");
                return Ok(output);
            }
            Err(StoreError::Conflict {
                expected, actual, ..
            }) => {
                if attempt >= policy.max_attempts {
                    warn!(pipeline_id = id, attempt, "optimistic lock retries exhausted");
                    return Err(EngineError::LockRetriesExhausted {
                        pipeline: id,
                        attempts: attempt,
                    });
                }
                let delay = policy.backoff(attempt);
                warn!(
                    pipeline_id = id,
                    expected,
                    actual,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "optimistic lock conflict; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(other) => return Err(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
        assert_eq!(policy.backoff(4), Duration::from_millis(50));
        assert_eq!(policy.backoff(40), Duration::from_millis(50));
    }
}
