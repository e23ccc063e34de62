// src/stage.rs

//! Stages of a pipeline.
//!
//! Two views exist. Persisted stages are rows stored on the pipeline with a
//! cached status that processing refreshes. Legacy stages are derived on the
//! fly from the latest jobs. Both compute status with the same aggregator.

use std::collections::BTreeMap;

use crate::job::Job;
use crate::status::{CompositeStatus, Status, composite};
use crate::types::StageMode;

/// A persisted stage row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    pub position: u32,
    pub status: Status,
}

impl Stage {
    pub fn new(name: impl Into<String>, position: u32) -> Self {
        Self {
            name: name.into(),
            position,
            status: Status::Created,
        }
    }
}

/// A stage as presented to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSummary {
    pub name: String,
    pub position: u32,
    pub status: Status,
    pub warnings: usize,
    /// Number of latest jobs in the stage.
    pub size: usize,
}

impl StageSummary {
    pub fn has_warnings(&self) -> bool {
        self.warnings > 0
    }
}

/// Jobs that take part in aggregation.
pub fn latest(jobs: &[Job]) -> impl Iterator<Item = &Job> {
    jobs.iter().filter(|job| job.is_latest())
}

fn summarize(name: &str, position: u32, members: &[&Job]) -> Option<StageSummary> {
    let CompositeStatus { status, warnings } = composite(members.iter().copied())?;
    Some(StageSummary {
        name: name.to_string(),
        position,
        status,
        warnings,
        size: members.len(),
    })
}

/// Stages derived from job `stage`/`stage_idx`. Stages without latest jobs do
/// not appear. Ordered by the highest `stage_idx` seen for each name.
pub fn legacy_stages(jobs: &[Job]) -> Vec<StageSummary> {
    let mut grouped: BTreeMap<&str, (u32, Vec<&Job>)> = BTreeMap::new();
    for job in latest(jobs) {
        let entry = grouped.entry(job.stage.as_str()).or_insert((0, Vec::new()));
        entry.0 = entry.0.max(job.stage_idx);
        entry.1.push(job);
    }

    let mut stages: Vec<StageSummary> = grouped
        .into_iter()
        .filter_map(|(name, (position, members))| summarize(name, position, &members))
        .collect();
    stages.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.name.cmp(&b.name)));
    stages
}

/// Single legacy stage by name.
pub fn legacy_stage(jobs: &[Job], name: &str) -> Option<StageSummary> {
    legacy_stages(jobs).into_iter().find(|stage| stage.name == name)
}

/// Persisted stages with freshly computed statuses. An empty stage keeps its
/// row and reports `skipped`.
pub fn persisted_stages(stages: &[Stage], jobs: &[Job]) -> Vec<StageSummary> {
    let mut out: Vec<StageSummary> = stages
        .iter()
        .map(|stage| {
            let members: Vec<&Job> = latest(jobs).filter(|job| job.stage == stage.name).collect();
            summarize(&stage.name, stage.position, &members).unwrap_or(StageSummary {
                name: stage.name.clone(),
                position: stage.position,
                status: Status::Skipped,
                warnings: 0,
                size: 0,
            })
        })
        .collect();
    out.sort_by_key(|stage| stage.position);
    out
}

/// Recompute cached statuses on persisted stage rows. Returns the names of
/// the stages whose status changed.
pub fn refresh_persisted(stages: &mut [Stage], jobs: &[Job]) -> Vec<String> {
    let fresh = persisted_stages(stages, jobs);
    let mut changed = Vec::new();
    for stage in stages.iter_mut() {
        if let Some(summary) = fresh.iter().find(|s| s.name == stage.name) {
            if stage.status != summary.status {
                stage.status = summary.status;
                changed.push(stage.name.clone());
            }
        }
    }
    changed
}

/// The stages to present for a pipeline. Pipelines that have not completed
/// always use the legacy view.
pub fn ordered_stages(
    stages: &[Stage],
    jobs: &[Job],
    pipeline_status: Status,
    mode: StageMode,
) -> Vec<StageSummary> {
    match mode {
        StageMode::Persisted if pipeline_status.is_completed() => persisted_stages(stages, jobs),
        _ => legacy_stages(jobs),
    }
}
