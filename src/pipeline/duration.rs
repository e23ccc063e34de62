// src/pipeline/duration.rs

//! Pipeline duration: the total time during which at least one job was
//! running. Overlapping job periods count once and gaps between them (queue
//! time, manual gates) do not count at all.

use chrono::{DateTime, Utc};

use crate::job::Job;
use crate::status::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Period {
    first: DateTime<Utc>,
    last: DateTime<Utc>,
}

/// Duration in seconds of the union of running periods of the latest jobs
/// that started. Jobs still running count up to `now`.
pub fn from_jobs(jobs: &[Job], now: DateTime<Utc>) -> i64 {
    let mut periods: Vec<Period> = jobs
        .iter()
        .filter(|job| job.is_latest())
        .filter(|job| {
            matches!(
                job.status,
                Status::Success | Status::Failed | Status::Running | Status::Canceled
            )
        })
        .filter_map(|job| {
            let first = job.started_at?;
            let last = job.finished_at.unwrap_or(now);
            Some(Period { first, last })
        })
        .collect();

    periods.sort_by_key(|p| p.first);
    merged(periods)
        .iter()
        .map(|p| (p.last - p.first).num_seconds().max(0))
        .sum()
}

fn merged(sorted: Vec<Period>) -> Vec<Period> {
    let mut out: Vec<Period> = Vec::with_capacity(sorted.len());
    for period in sorted {
        match out.last_mut() {
            Some(current) if period.first <= current.last => {
                current.last = current.last.max(period.last);
            }
            _ => out.push(period),
        }
    }
    out
}
