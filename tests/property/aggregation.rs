use chrono::DateTime;
use proptest::prelude::*;

use pipeline_engine::job::Job;
use pipeline_engine::status::{Status, composite};

fn status_strategy() -> impl Strategy<Value = Status> {
    prop::sample::select(Status::ALL.to_vec())
}

fn jobs(members: &[(Status, bool)]) -> Vec<Job> {
    let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    members
        .iter()
        .enumerate()
        .map(|(i, (status, allow_failure))| {
            let mut job = Job::build(i as u64 + 1, 1, format!("job_{i}"), "test", 0, now);
            job.status = *status;
            job.allow_failure = *allow_failure;
            job
        })
        .collect()
}

proptest! {
    // The order in which jobs finished must not change the stage result.
    #[test]
    fn aggregation_ignores_member_order(
        members in proptest::collection::vec((status_strategy(), any::<bool>()), 1..12),
        rotate in 0usize..12,
    ) {
        let forward = jobs(&members);
        let mut shuffled = forward.clone();
        shuffled.reverse();
        let len = shuffled.len();
        shuffled.rotate_left(rotate % len);

        prop_assert_eq!(composite(forward.iter()), composite(shuffled.iter()));
    }

    #[test]
    fn a_failure_that_is_not_allowed_always_wins(
        members in proptest::collection::vec((status_strategy(), any::<bool>()), 0..12),
    ) {
        let mut members = members;
        members.push((Status::Failed, false));
        let result = composite(jobs(&members).iter()).unwrap();
        prop_assert_eq!(result.status, Status::Failed);
    }

    #[test]
    fn allowed_failures_count_as_warnings(
        n in 1usize..8,
    ) {
        let members = vec![(Status::Failed, true); n];
        let result = composite(jobs(&members).iter()).unwrap();
        prop_assert_eq!(result.status, Status::Success);
        prop_assert_eq!(result.warnings, n);
    }
}

#[test]
fn empty_groups_have_no_status() {
    assert!(composite(jobs(&[]).iter()).is_none());
}
