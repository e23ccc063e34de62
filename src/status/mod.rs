// src/status/mod.rs

//! Status values shared by jobs, stages and pipelines.
//!
//! - [`Status`] is the closed set of states every state machine in the crate
//!   works with. Strings coming from the outside world (runners, the CLI) are
//!   parsed once at the boundary via [`FromStr`]; everything past that point
//!   matches exhaustively.
//! - [`composite`] holds the stage aggregator that folds many statuses into
//!   one using a fixed precedence order.

pub mod composite;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

pub use composite::{CompositeStatus, composite, composite_of_statuses};

/// Status of a job, stage or pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Created,
    Preparing,
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
    Manual,
    Scheduled,
}

impl Status {
    pub const ALL: [Status; 10] = [
        Status::Created,
        Status::Preparing,
        Status::Pending,
        Status::Running,
        Status::Success,
        Status::Failed,
        Status::Canceled,
        Status::Skipped,
        Status::Manual,
        Status::Scheduled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Preparing => "preparing",
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failed => "failed",
            Status::Canceled => "canceled",
            Status::Skipped => "skipped",
            Status::Manual => "manual",
            Status::Scheduled => "scheduled",
        }
    }

    /// `success`, `failed`, `canceled` and `skipped`.
    pub fn is_completed(self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failed | Status::Canceled | Status::Skipped
        )
    }

    /// States in which work is queued or executing.
    pub fn is_active(self) -> bool {
        matches!(self, Status::Preparing | Status::Pending | Status::Running)
    }

    /// States that hold up later stages until a user or a timer acts.
    pub fn is_blocked(self) -> bool {
        matches!(self, Status::Manual | Status::Scheduled)
    }

    /// States a cancel request moves to `canceled`.
    pub fn is_cancelable(self) -> bool {
        matches!(
            self,
            Status::Created
                | Status::Preparing
                | Status::Pending
                | Status::Running
                | Status::Manual
                | Status::Scheduled
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| EngineError::UnknownStatus(s.to_string()))
    }
}

/// Capability shared by everything that carries a status and takes part in
/// aggregation.
pub trait StatusHolder {
    fn status(&self) -> Status;

    fn allow_failure(&self) -> bool {
        false
    }

    /// Failed or canceled, but allowed to fail. Shown as a warning.
    fn failed_but_allowed(&self) -> bool {
        self.allow_failure() && matches!(self.status(), Status::Failed | Status::Canceled)
    }

    /// Left out of aggregation entirely: allowed failures and optional
    /// manual actions.
    fn is_ignored(&self) -> bool {
        self.failed_but_allowed() || (self.allow_failure() && self.status() == Status::Manual)
    }
}

impl StatusHolder for Status {
    fn status(&self) -> Status {
        *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_statuses_case_insensitively() {
        assert_eq!("Running".parse::<Status>().unwrap(), Status::Running);
        assert_eq!(" scheduled ".parse::<Status>().unwrap(), Status::Scheduled);
    }

    #[test]
    fn unknown_status_is_an_error() {
        let err = "waiting_for_resource".parse::<Status>().unwrap_err();
        assert!(matches!(err, EngineError::UnknownStatus(s) if s == "waiting_for_resource"));
    }

    #[test]
    fn display_round_trips_through_from_str() {
        for status in Status::ALL {
            assert_eq!(status.to_string().parse::<Status>().unwrap(), status);
        }
    }

    #[test]
    fn completed_and_cancelable_are_disjoint() {
        for status in Status::ALL {
            assert!(!(status.is_completed() && status.is_cancelable()), "{status}");
        }
    }
}
