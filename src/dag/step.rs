// src/dag/step.rs

//! Result type for a single processing pass.

use crate::effects::Effect;
use crate::job::JobTransition;
use crate::pipeline::PipelineTransition;

/// Structured result of processing a pipeline once.
///
/// Tests step the engine by hand and assert on what changed; the runtime
/// dispatches [`ProcessingStep::effects`] after the record is written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingStep {
    /// Job status changes, in the order they happened.
    pub job_transitions: Vec<JobTransition>,
    /// The pipeline status change, if any.
    pub pipeline_transition: Option<PipelineTransition>,
    /// Persisted stages whose cached status changed.
    pub stage_changes: Vec<String>,
    /// Whether this step moved the pipeline into a terminal status.
    pub pipeline_finished: bool,
}

impl ProcessingStep {
    pub fn is_empty(&self) -> bool {
        self.job_transitions.is_empty()
            && self.pipeline_transition.is_none()
            && self.stage_changes.is_empty()
    }

    pub fn push_job(&mut self, transition: JobTransition) {
        self.job_transitions.push(transition);
    }

    /// Append another step's changes. The later pipeline transition wins.
    pub fn merge(&mut self, other: ProcessingStep) {
        self.job_transitions.extend(other.job_transitions);
        for stage in other.stage_changes {
            if !self.stage_changes.contains(&stage) {
                self.stage_changes.push(stage);
            }
        }
        if other.pipeline_transition.is_some() {
            self.pipeline_finished = other.pipeline_finished;
            self.pipeline_transition = other.pipeline_transition;
        }
    }

    /// Effects of every job transition followed by those of the pipeline
    /// transition.
    pub fn effects(&self) -> Vec<Effect> {
        self.job_transitions
            .iter()
            .flat_map(|t| t.effects.iter().cloned())
            .chain(
                self.pipeline_transition
                    .iter()
                    .flat_map(|t| t.effects.iter().cloned()),
            )
            .collect()
    }

    /// Latest status reached by a job in this step.
    pub fn job_status(&self, job_id: u64) -> Option<crate::status::Status> {
        self.job_transitions
            .iter()
            .rev()
            .find(|t| t.job_id == job_id)
            .map(|t| t.to)
    }
}
