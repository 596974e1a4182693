//! Failure-escalation and stale-run policy.
//!
//! These are pure functions of (current counters, outcome) so both store
//! backends share one implementation and it can be tested without a database.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobStatus, RunStatus, ValidationError};

/// Error recorded on runs reclaimed by the stale-run reaper.
pub const STALE_RUN_ERROR: &str = "run exceeded stale timeout; worker presumed lost";

/// The counters a job keeps about its runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub run_count: i64,
    pub error_count: i64,
    pub consecutive_failures: i64,
}

/// Fold one run outcome into a job's counters and status.
///
/// `complete_job` wins over failure escalation. Escalation only moves an
/// `Active` job to `Paused`; jobs already paused, completed or failed keep
/// their status.
pub fn apply_outcome(
    counters: JobCounters,
    status: JobStatus,
    outcome: RunStatus,
    max_failures: i64,
    complete_job: bool,
) -> (JobCounters, JobStatus) {
    let mut next = JobCounters {
        run_count: counters.run_count + 1,
        ..counters
    };
    let mut next_status = status;

    if outcome.is_failure() {
        next.error_count += 1;
        next.consecutive_failures += 1;
        next_status = escalate(next_status, next.consecutive_failures, max_failures);
    } else {
        next.consecutive_failures = 0;
    }

    if complete_job {
        next_status = JobStatus::Completed;
    }
    (next, next_status)
}

/// Fold `reclaimed` timed-out runs of one job into its counters and status.
pub fn apply_stale_runs(
    counters: JobCounters,
    status: JobStatus,
    reclaimed: i64,
    max_failures: i64,
) -> (JobCounters, JobStatus) {
    if reclaimed <= 0 {
        return (counters, status);
    }
    let next = JobCounters {
        run_count: counters.run_count + reclaimed,
        error_count: counters.error_count + reclaimed,
        consecutive_failures: counters.consecutive_failures + reclaimed,
    };
    let next_status = escalate(status, next.consecutive_failures, max_failures);
    (next, next_status)
}

fn escalate(status: JobStatus, consecutive_failures: i64, max_failures: i64) -> JobStatus {
    if status == JobStatus::Active && consecutive_failures >= max_failures {
        JobStatus::Paused
    } else {
        status
    }
}

/// Wall-clock duration of a run, clamped at zero under clock skew.
pub fn run_duration_ms(started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> i64 {
    (completed_at - started_at).num_milliseconds().max(0)
}

/// Start-time cutoff for the stale-run reaper: runs started before it are
/// stale. A negative threshold would reclaim runs that just started.
pub fn stale_cutoff(
    older_than: Duration,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ValidationError> {
    if older_than < Duration::zero() {
        return Err(ValidationError::new("older_than", "must not be negative"));
    }
    now.checked_sub_signed(older_than)
        .ok_or_else(|| ValidationError::new("older_than", "is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn counters(run: i64, err: i64, consecutive: i64) -> JobCounters {
        JobCounters {
            run_count: run,
            error_count: err,
            consecutive_failures: consecutive,
        }
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let (c, s) =
            apply_outcome(counters(4, 3, 3), JobStatus::Active, RunStatus::Success, 5, false);
        assert_eq!(c, counters(5, 3, 0));
        assert_eq!(s, JobStatus::Active);
    }

    #[test]
    fn test_skipped_counts_as_non_failure() {
        let (c, _) =
            apply_outcome(counters(1, 1, 1), JobStatus::Active, RunStatus::Skipped, 5, false);
        assert_eq!(c, counters(2, 1, 0));
    }

    #[test]
    fn test_error_and_timeout_increment() {
        let (c, s) =
            apply_outcome(counters(0, 0, 0), JobStatus::Active, RunStatus::Error, 5, false);
        assert_eq!(c, counters(1, 1, 1));
        assert_eq!(s, JobStatus::Active);
        let (c, _) = apply_outcome(c, s, RunStatus::Timeout, 5, false);
        assert_eq!(c, counters(2, 2, 2));
    }

    #[test]
    fn test_pauses_at_max_failures() {
        let (c, s) =
            apply_outcome(counters(2, 2, 2), JobStatus::Active, RunStatus::Error, 3, false);
        assert_eq!(c.consecutive_failures, 3);
        assert_eq!(s, JobStatus::Paused);
    }

    #[test]
    fn test_complete_job_overrides_escalation() {
        let (_, s) =
            apply_outcome(counters(2, 2, 2), JobStatus::Active, RunStatus::Error, 3, true);
        assert_eq!(s, JobStatus::Completed);
        let (_, s) =
            apply_outcome(counters(0, 0, 0), JobStatus::Active, RunStatus::Success, 3, true);
        assert_eq!(s, JobStatus::Completed);
    }

    #[test]
    fn test_terminal_status_not_reopened() {
        let (_, s) =
            apply_outcome(counters(9, 9, 9), JobStatus::Completed, RunStatus::Error, 3, false);
        assert_eq!(s, JobStatus::Completed);
    }

    #[test]
    fn test_stale_runs_add_in_bulk() {
        let (c, s) = apply_stale_runs(counters(1, 0, 0), JobStatus::Active, 2, 5);
        assert_eq!(c, counters(3, 2, 2));
        assert_eq!(s, JobStatus::Active);
        let (_, s) = apply_stale_runs(counters(1, 4, 4), JobStatus::Active, 1, 5);
        assert_eq!(s, JobStatus::Paused);
    }

    #[test]
    fn test_stale_runs_zero_is_noop() {
        let (c, s) = apply_stale_runs(counters(1, 1, 1), JobStatus::Active, 0, 1);
        assert_eq!(c, counters(1, 1, 1));
        assert_eq!(s, JobStatus::Active);
    }

    #[test]
    fn test_duration_clamped_under_skew() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(run_duration_ms(t, t + Duration::milliseconds(1500)), 1500);
        assert_eq!(run_duration_ms(t, t - Duration::seconds(2)), 0);
    }

    #[test]
    fn test_stale_cutoff() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(stale_cutoff(Duration::minutes(30), t).unwrap(), t - Duration::minutes(30));
        assert_eq!(stale_cutoff(Duration::zero(), t).unwrap(), t);

        let err = stale_cutoff(Duration::seconds(-1), t).unwrap_err();
        assert_eq!(err.field, "older_than");
        assert!(stale_cutoff(Duration::MAX, t).is_err());
    }
}
