// src/exec/runner_loop.rs

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::ConfigFile;
use crate::engine::{Engine, EngineEvent, PickedJob};
use crate::job::FailureReason;
use crate::runner::HeartbeatInfo;
use crate::status::Status;
use crate::types::RunnerId;

/// How simulated runners behave.
#[derive(Debug, Clone)]
pub struct RunPlan {
    /// Jobs that report `failed`.
    pub failing: HashSet<String>,
    /// How long each job "runs".
    pub durations: HashMap<String, Duration>,
    pub default_duration: Duration,
    /// Delay between job requests when nothing is pending.
    pub poll_interval: Duration,
}

impl Default for RunPlan {
    fn default() -> Self {
        Self {
            failing: HashSet::new(),
            durations: HashMap::new(),
            default_duration: Duration::from_millis(50),
            poll_interval: Duration::from_millis(25),
        }
    }
}

impl RunPlan {
    pub fn from_config(cfg: &ConfigFile, failing: impl IntoIterator<Item = String>) -> Self {
        Self {
            failing: failing.into_iter().collect(),
            durations: cfg
                .job
                .iter()
                .filter_map(|(name, job)| {
                    job.duration_ms
                        .map(|ms| (name.clone(), Duration::from_millis(ms)))
                })
                .collect(),
            ..Self::default()
        }
    }

    /// Outcome of running `picked`: the reported status, the failure reason
    /// and how long the run took.
    pub fn outcome(&self, picked: &PickedJob) -> (Status, Option<FailureReason>, Duration) {
        let wanted = self
            .durations
            .get(&picked.job.name)
            .copied()
            .unwrap_or(self.default_duration);
        let limit = Duration::from_secs(picked.timeout.secs);

        if wanted > limit {
            (Status::Failed, Some(FailureReason::JobExecutionTimeout), limit)
        } else if self.failing.contains(&picked.job.name) {
            (Status::Failed, Some(FailureReason::ScriptFailure), wanted)
        } else {
            (Status::Success, None, wanted)
        }
    }
}

/// Spawn a simulated runner.
///
/// It heartbeats, asks the engine for a job, "runs" it for the planned
/// duration and reports the result on `runtime_tx`. It stops once the
/// runtime has gone away.
pub fn spawn_runner(
    engine: Arc<Engine>,
    runner_id: RunnerId,
    runtime_tx: mpsc::Sender<EngineEvent>,
    plan: Arc<RunPlan>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let heartbeat = HeartbeatInfo {
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            executor: Some("shell".to_string()),
            platform: Some(std::env::consts::OS.to_string()),
            architecture: Some(std::env::consts::ARCH.to_string()),
            ..HeartbeatInfo::default()
        };

        while !runtime_tx.is_closed() {
            if let Err(err) = engine.heartbeat(runner_id, heartbeat.clone()) {
                warn!(runner_id, error = %err, "heartbeat rejected; runner stopping");
                break;
            }

            let picked = match engine.pick_job(runner_id).await {
                Ok(Some(picked)) => picked,
                Ok(None) => {
                    sleep(plan.poll_interval).await;
                    continue;
                }
                Err(err) => {
                    warn!(runner_id, error = %err, "job request failed");
                    sleep(plan.poll_interval).await;
                    continue;
                }
            };

            let (status, failure_reason, took) = plan.outcome(&picked);
            debug!(runner_id, job = %picked.job.name, ?took, "running job");
            sleep(took).await;

            info!(
                runner_id,
                pipeline_id = picked.pipeline_id,
                job = %picked.job.name,
                %status,
                "job finished"
            );
            let report = EngineEvent::JobUpdated {
                pipeline_id: picked.pipeline_id,
                job_id: picked.job.id,
                status,
                failure_reason,
            };
            if runtime_tx.send(report).await.is_err() {
                break;
            }
        }

        debug!(runner_id, "runner stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::runner::{ResolvedTimeout, TimeoutSource};
    use chrono::DateTime;

    fn picked(name: &str, timeout_secs: u64) -> PickedJob {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        PickedJob {
            pipeline_id: 1,
            job: Job::build(1, 1, name, "test", 0, now),
            timeout: ResolvedTimeout {
                secs: timeout_secs,
                source: TimeoutSource::Project,
            },
            variables: Vec::new(),
        }
    }

    #[test]
    fn planned_outcomes() {
        let mut plan = RunPlan {
            failing: ["lint".to_string()].into_iter().collect(),
            ..RunPlan::default()
        };
        plan.durations.insert("slow".into(), Duration::from_secs(5));

        assert_eq!(plan.outcome(&picked("unit", 60)).0, Status::Success);
        assert_eq!(
            plan.outcome(&picked("lint", 60)).1,
            Some(FailureReason::ScriptFailure)
        );
        let (status, reason, took) = plan.outcome(&picked("slow", 1));
        assert_eq!(status, Status::Failed);
        assert_eq!(reason, Some(FailureReason::JobExecutionTimeout));
        assert_eq!(took, Duration::from_secs(1));
    }
}
