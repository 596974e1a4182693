//! Next-run computation after a run finishes.
//!
//! The store never computes schedules; the worker asks a [`ScheduleAdvancer`]
//! and passes the answer to `complete_run`. Cron evaluation is pluggable and
//! absent by default.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use agentjobs_types::{AgentJob, ScheduleKind};

/// Where a job goes after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Due again at this time.
    At(DateTime<Utc>),
    /// The job has nothing left to do; mark it completed.
    Finished,
    /// No next time is known; leave `next_run_at` empty.
    Unscheduled,
}

pub trait ScheduleAdvancer: Send + Sync {
    fn next_run_after(&self, job: &AgentJob, finished_at: DateTime<Utc>) -> Advance;
}

/// `(cron_expr, timezone, after) -> next fire time`.
pub type CronEvaluator =
    Arc<dyn Fn(&str, &str, DateTime<Utc>) -> Option<DateTime<Utc>> + Send + Sync>;

/// Handles interval and one-off schedules; cron only with an evaluator.
#[derive(Clone, Default)]
pub struct FixedScheduleAdvancer {
    cron: Option<CronEvaluator>,
}

impl FixedScheduleAdvancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cron(cron: CronEvaluator) -> Self {
        Self { cron: Some(cron) }
    }
}

impl ScheduleAdvancer for FixedScheduleAdvancer {
    fn next_run_after(&self, job: &AgentJob, finished_at: DateTime<Utc>) -> Advance {
        match job.schedule_kind {
            ScheduleKind::Interval => {
                let next = job
                    .interval_ms
                    .filter(|ms| *ms > 0)
                    .and_then(Duration::try_milliseconds)
                    .and_then(|step| finished_at.checked_add_signed(step));
                match next {
                    Some(next) => Advance::At(next),
                    None => {
                        warn!(
                            job_id = %job.id,
                            interval_ms = ?job.interval_ms,
                            "Interval next run out of range; leaving job unscheduled"
                        );
                        Advance::Unscheduled
                    }
                }
            }
            ScheduleKind::Once => Advance::Finished,
            ScheduleKind::Cron => {
                let (Some(eval), Some(expr)) = (&self.cron, job.cron_expr.as_deref()) else {
                    warn!(job_id = %job.id, "No cron evaluator; leaving job unscheduled");
                    return Advance::Unscheduled;
                };
                match eval(expr, &job.timezone, finished_at) {
                    Some(next) => Advance::At(next),
                    None => {
                        warn!(job_id = %job.id, cron = expr, "Cron has no next fire time");
                        Advance::Unscheduled
                    }
                }
            }
        }
    }
}
