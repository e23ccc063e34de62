use std::collections::HashSet;

use proptest::prelude::*;

use pipeline_engine::config::ConfigFile;
use pipeline_engine::engine::{EngineCommand, apply};
use pipeline_engine::pipeline::PipelineRecord;
use pipeline_engine::status::Status;
use pipeline_engine_test_utils::builders::{ConfigFileBuilder, JobConfigBuilder, seeded};
use pipeline_engine_test_utils::fixed_now;

const STAGES: [&str; 3] = ["s0", "s1", "s2"];

#[derive(Debug, Clone)]
struct JobSpec {
    stage: usize,
    needs: Vec<usize>,
    allow_failure: bool,
}

// Needs may only point at jobs in an earlier stage, which also keeps the
// graph acyclic.
fn config_strategy(max_jobs: usize) -> impl Strategy<Value = (ConfigFile, Vec<JobSpec>)> {
    proptest::collection::vec(
        (
            0..STAGES.len(),
            proptest::collection::vec(any::<usize>(), 0..3),
            any::<bool>(),
        ),
        1..=max_jobs,
    )
    .prop_map(|raw| {
        let stages: Vec<usize> = raw.iter().map(|(stage, _, _)| *stage).collect();
        let specs: Vec<JobSpec> = raw
            .into_iter()
            .map(|(stage, picks, allow_failure)| {
                let earlier: Vec<usize> = (0..stages.len()).filter(|j| stages[*j] < stage).collect();
                let needs: HashSet<usize> = if earlier.is_empty() {
                    HashSet::new()
                } else {
                    picks.into_iter().map(|p| earlier[p % earlier.len()]).collect()
                };
                JobSpec {
                    stage,
                    needs: needs.into_iter().collect(),
                    allow_failure,
                }
            })
            .collect();

        let mut builder = ConfigFileBuilder::new().with_stages(&STAGES);
        for (i, spec) in specs.iter().enumerate() {
            let mut job = JobConfigBuilder::new(STAGES[spec.stage]);
            for need in &spec.needs {
                job = job.needs(&format!("job_{need}"));
            }
            if spec.allow_failure {
                job = job.allow_failure();
            }
            builder = builder.with_job(&format!("job_{i}"), job.build());
        }
        (builder.build(), specs)
    })
}

fn report(rec: &mut PipelineRecord, job_id: u64, status: Status) {
    let command = EngineCommand::UpdateJob {
        job_id,
        status,
        failure_reason: None,
        runner_id: None,
    };
    apply(rec, &command, fixed_now()).expect("runner reports are valid");
}

proptest! {
    #[test]
    fn every_pipeline_runs_to_a_terminal_state(
        (cfg, specs) in config_strategy(8),
        failing in proptest::collection::hash_set(0usize..8, 0..4),
    ) {
        let mut rec = seeded(&cfg, 1);
        apply(&mut rec, &EngineCommand::Process, fixed_now()).unwrap();

        // Each job runs at most once, so this bounds the loop.
        for _ in 0..=specs.len() {
            let Some(job) = rec.latest_jobs().find(|job| job.status == Status::Pending).cloned() else {
                break;
            };
            let index: usize = job.name.trim_start_matches("job_").parse().unwrap();
            let outcome = if failing.contains(&index) { Status::Failed } else { Status::Success };
            report(&mut rec, job.id, Status::Running);
            report(&mut rec, job.id, outcome);
        }

        prop_assert!(rec.status().is_completed(), "pipeline stuck in {}", rec.status());
        prop_assert!(rec.latest_jobs().all(|job| job.status.is_completed()));

        let hard_failure = rec
            .latest_jobs()
            .any(|job| job.status == Status::Failed && !job.allow_failure);
        prop_assert_eq!(rec.status() == Status::Failed, hard_failure);
    }
}
