// src/status/composite.rs

//! Stage aggregation.
//!
//! A group of statuses folds into a single status by taking the member with
//! the highest precedence. Because this is a maximum over a total order the
//! result does not depend on the order in which jobs finished.

use super::{Status, StatusHolder};

/// Highest precedence first.
const PRECEDENCE: [Status; 10] = [
    Status::Failed,
    Status::Running,
    Status::Pending,
    Status::Preparing,
    Status::Manual,
    Status::Scheduled,
    Status::Created,
    Status::Canceled,
    Status::Success,
    Status::Skipped,
];

fn rank(status: Status) -> usize {
    // Lower is stronger. PRECEDENCE covers every variant.
    PRECEDENCE
        .iter()
        .position(|s| *s == status)
        .unwrap_or(PRECEDENCE.len())
}

/// Aggregated status of a group of jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeStatus {
    pub status: Status,
    /// Number of members that failed but were allowed to.
    pub warnings: usize,
}

impl CompositeStatus {
    pub fn has_warnings(&self) -> bool {
        self.warnings > 0
    }
}

/// Aggregate a group of status holders.
///
/// Returns `None` for an empty group: an empty stage contributes nothing to
/// its pipeline, it is not a success.
pub fn composite<'a, H, I>(members: I) -> Option<CompositeStatus>
where
    H: StatusHolder + 'a,
    I: IntoIterator<Item = &'a H>,
{
    let mut seen_any = false;
    let mut warnings = 0;
    let mut strongest: Option<Status> = None;

    for member in members {
        seen_any = true;

        if member.failed_but_allowed() {
            warnings += 1;
        }
        if member.is_ignored() {
            continue;
        }

        let status = member.status();
        strongest = match strongest {
            Some(current) if rank(current) <= rank(status) => Some(current),
            _ => Some(status),
        };
    }

    if !seen_any {
        return None;
    }

    let status = match strongest {
        Some(status) => status,
        // Every member was ignored.
        None if warnings > 0 => Status::Success,
        None => Status::Skipped,
    };

    Some(CompositeStatus { status, warnings })
}

/// Aggregate already-aggregated statuses (e.g. stage results into a
/// pipeline result). Warnings are summed.
pub fn composite_of_statuses<I>(parts: I) -> Option<CompositeStatus>
where
    I: IntoIterator<Item = CompositeStatus>,
{
    parts.into_iter().reduce(|acc, part| CompositeStatus {
        status: if rank(part.status) < rank(acc.status) {
            part.status
        } else {
            acc.status
        },
        warnings: acc.warnings + part.warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Member(Status, bool);

    impl StatusHolder for Member {
        fn status(&self) -> Status {
            self.0
        }
        fn allow_failure(&self) -> bool {
            self.1
        }
    }

    fn agg(members: &[Member]) -> Option<CompositeStatus> {
        composite(members.iter())
    }

    #[test]
    fn empty_group_has_no_status() {
        assert_eq!(agg(&[]), None);
    }

    #[test]
    fn allowed_failure_counts_as_warning_not_failure() {
        let result = agg(&[
            Member(Status::Success, false),
            Member(Status::Failed, true),
        ])
        .unwrap();
        assert_eq!(result.status, Status::Success);
        assert_eq!(result.warnings, 1);
    }

    #[test]
    fn running_beats_pending() {
        let result = agg(&[
            Member(Status::Running, false),
            Member(Status::Pending, false),
        ])
        .unwrap();
        assert_eq!(result.status, Status::Running);
    }

    #[test]
    fn single_failure_wins_over_many_successes() {
        let mut members: Vec<Member> = (0..20).map(|_| Member(Status::Success, false)).collect();
        members.push(Member(Status::Failed, false));
        assert_eq!(agg(&members).unwrap().status, Status::Failed);
    }

    #[test]
    fn optional_manual_job_is_ignored() {
        let result = agg(&[
            Member(Status::Success, false),
            Member(Status::Manual, true),
        ])
        .unwrap();
        assert_eq!(result.status, Status::Success);
        assert_eq!(result.warnings, 0);
    }

    #[test]
    fn blocking_manual_job_holds_the_stage() {
        let result = agg(&[
            Member(Status::Success, false),
            Member(Status::Manual, false),
        ])
        .unwrap();
        assert_eq!(result.status, Status::Manual);
    }

    #[test]
    fn all_ignored_members() {
        assert_eq!(
            agg(&[Member(Status::Failed, true)]).unwrap().status,
            Status::Success
        );
        assert_eq!(
            agg(&[Member(Status::Manual, true)]).unwrap().status,
            Status::Skipped
        );
    }

    #[test]
    fn canceled_beats_success_but_not_created() {
        assert_eq!(
            agg(&[Member(Status::Success, false), Member(Status::Canceled, false)])
                .unwrap()
                .status,
            Status::Canceled
        );
        assert_eq!(
            agg(&[Member(Status::Created, false), Member(Status::Canceled, false)])
                .unwrap()
                .status,
            Status::Created
        );
    }

    #[test]
    fn stage_results_combine_with_summed_warnings() {
        let stages = [
            CompositeStatus { status: Status::Success, warnings: 1 },
            CompositeStatus { status: Status::Pending, warnings: 2 },
        ];
        let result = composite_of_statuses(stages).unwrap();
        assert_eq!(result.status, Status::Pending);
        assert_eq!(result.warnings, 3);
    }
}
