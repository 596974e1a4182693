//! agentjobs-types: shared data model for the agent job scheduler.
//!
//! Jobs and runs mirror the persisted `agent_jobs` / `agent_job_runs` rows.
//! Everything in this crate is pure: no I/O, no clocks.

pub mod policy;
pub mod validate;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use validate::ValidationError;

/// Default number of consecutive failures before a job is paused.
pub const DEFAULT_MAX_FAILURES: i64 = 5;

/// Default timezone attached to new jobs.
pub const DEFAULT_TIMEZONE: &str = "UTC";

/// Hard cap on the number of jobs returned by a single list call.
pub const MAX_LIST_JOBS: usize = 200;

// ──────────────────── Enums ────────────────────

macro_rules! string_enum {
    ($name:ident, $field:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ValidationError::new($field, format!("unknown value {other:?}"))),
                }
            }
        }
    };
}

/// How a job recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Cron,
    Interval,
    Once,
}

string_enum!(ScheduleKind, "schedule_kind", {
    Cron => "cron",
    Interval => "interval",
    Once => "once",
});

/// What a job delivers when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Message,
    SystemEvent,
}

string_enum!(PayloadKind, "payload_kind", {
    Message => "message",
    SystemEvent => "system_event",
});

/// Scheduling status of a job. Only `Active` jobs are picked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

string_enum!(JobStatus, "status", {
    Active => "active",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
});

/// Status of a single run. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Error,
    Timeout,
    Skipped,
}

string_enum!(RunStatus, "status", {
    Running => "running",
    Success => "success",
    Error => "error",
    Timeout => "timeout",
    Skipped => "skipped",
});

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Outcomes that count against a job's failure budget.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Error | Self::Timeout)
    }
}

// ──────────────────── Job Types ────────────────────

/// A persisted, schedulable unit of work owned by one tenant and one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentJob {
    pub id: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub schedule_kind: ScheduleKind,
    /// Set iff `schedule_kind == Cron`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expr: Option<String>,
    /// Set iff `schedule_kind == Interval`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<i64>,
    /// Set iff `schedule_kind == Once`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    pub timezone: String,
    pub payload_kind: PayloadKind,
    pub payload_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub enabled: bool,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_error: Option<String>,
    /// `None` means the job is not currently due: either leased and not yet
    /// reported, or simply unscheduled.
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: i64,
    pub error_count: i64,
    pub consecutive_failures: i64,
    pub max_failures: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentJob {
    pub fn counters(&self) -> policy::JobCounters {
        policy::JobCounters {
            run_count: self.run_count,
            error_count: self.error_count,
            consecutive_failures: self.consecutive_failures,
        }
    }

    fn set_counters(&mut self, counters: policy::JobCounters) {
        self.run_count = counters.run_count;
        self.error_count = counters.error_count;
        self.consecutive_failures = counters.consecutive_failures;
    }

    /// Drop schedule details that do not belong to `schedule_kind`.
    pub fn normalize_schedule(&mut self) {
        if self.schedule_kind != ScheduleKind::Cron {
            self.cron_expr = None;
        }
        if self.schedule_kind != ScheduleKind::Interval {
            self.interval_ms = None;
        }
        if self.schedule_kind != ScheduleKind::Once {
            self.run_at = None;
        }
    }

    /// Fold a completed run into the job's summary fields.
    pub fn record_completion(&mut self, run: &AgentJobRun, input: &CompleteRunInput) {
        let (counters, status) = policy::apply_outcome(
            self.counters(),
            self.status,
            input.status,
            self.max_failures,
            input.complete_job,
        );
        self.set_counters(counters);
        self.status = status;
        self.last_run_at = Some(input.completed_at);
        self.last_run_status = Some(input.status);
        self.last_run_error = if input.status.is_failure() {
            input.error.clone()
        } else {
            None
        };
        self.next_run_at = input.next_run_at;
        self.updated_at = input.completed_at.max(run.started_at);
    }

    /// Fold `reclaimed` stale runs into the job's summary fields.
    pub fn record_stale_runs(&mut self, reclaimed: i64, now: DateTime<Utc>) {
        let (counters, status) =
            policy::apply_stale_runs(self.counters(), self.status, reclaimed, self.max_failures);
        self.set_counters(counters);
        self.status = status;
        self.last_run_at = Some(now);
        self.last_run_status = Some(RunStatus::Timeout);
        self.last_run_error = Some(policy::STALE_RUN_ERROR.to_string());
        self.updated_at = now;
    }
}

/// Input for creating a job. Unset optional fields take defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAgentJob {
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub schedule_kind: ScheduleKind,
    #[serde(default)]
    pub cron_expr: Option<String>,
    #[serde(default)]
    pub interval_ms: Option<i64>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timezone: Option<String>,
    pub payload_kind: PayloadKind,
    pub payload_text: String,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub max_failures: Option<i64>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl NewAgentJob {
    /// Build the full job record with defaults applied. The result is not
    /// validated; call [`validate::validate_job`] before persisting.
    pub fn into_job(self, id: String, tenant_id: String, now: DateTime<Utc>) -> AgentJob {
        let mut job = AgentJob {
            id,
            tenant_id,
            agent_id: self.agent_id,
            name: self.name,
            description: self.description,
            schedule_kind: self.schedule_kind,
            cron_expr: self.cron_expr,
            interval_ms: self.interval_ms,
            run_at: self.run_at,
            timezone: self.timezone.unwrap_or_else(|| DEFAULT_TIMEZONE.to_string()),
            payload_kind: self.payload_kind,
            payload_text: self.payload_text,
            room_id: self.room_id,
            enabled: self.enabled.unwrap_or(true),
            status: JobStatus::Active,
            last_run_at: None,
            last_run_status: None,
            last_run_error: None,
            next_run_at: self.next_run_at,
            run_count: 0,
            error_count: 0,
            consecutive_failures: 0,
            max_failures: self.max_failures.unwrap_or(DEFAULT_MAX_FAILURES),
            created_by: self.created_by,
            created_at: now,
            updated_at: now,
        };
        job.normalize_schedule();
        job
    }
}

/// Partial update. `None` leaves a field untouched; for nullable columns
/// `Some(None)` clears the value.
#[derive(Debug, Clone, Default)]
pub struct AgentJobPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub schedule_kind: Option<ScheduleKind>,
    pub cron_expr: Option<Option<String>>,
    pub interval_ms: Option<Option<i64>>,
    pub run_at: Option<Option<DateTime<Utc>>>,
    pub timezone: Option<String>,
    pub payload_kind: Option<PayloadKind>,
    pub payload_text: Option<String>,
    pub room_id: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub status: Option<JobStatus>,
    pub max_failures: Option<i64>,
    pub next_run_at: Option<Option<DateTime<Utc>>>,
}

impl AgentJobPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.schedule_kind.is_none()
            && self.cron_expr.is_none()
            && self.interval_ms.is_none()
            && self.run_at.is_none()
            && self.timezone.is_none()
            && self.payload_kind.is_none()
            && self.payload_text.is_none()
            && self.room_id.is_none()
            && self.enabled.is_none()
            && self.status.is_none()
            && self.max_failures.is_none()
            && self.next_run_at.is_none()
    }

    /// Apply present fields onto `job`. Counters and run summaries are never
    /// touched here.
    pub fn apply(&self, job: &mut AgentJob, now: DateTime<Utc>) {
        if let Some(name) = &self.name {
            job.name = name.clone();
        }
        if let Some(description) = &self.description {
            job.description = description.clone();
        }
        if let Some(kind) = self.schedule_kind {
            job.schedule_kind = kind;
        }
        if let Some(cron_expr) = &self.cron_expr {
            job.cron_expr = cron_expr.clone();
        }
        if let Some(interval_ms) = self.interval_ms {
            job.interval_ms = interval_ms;
        }
        if let Some(run_at) = self.run_at {
            job.run_at = run_at;
        }
        if let Some(timezone) = &self.timezone {
            job.timezone = timezone.clone();
        }
        if let Some(kind) = self.payload_kind {
            job.payload_kind = kind;
        }
        if let Some(text) = &self.payload_text {
            job.payload_text = text.clone();
        }
        if let Some(room_id) = &self.room_id {
            job.room_id = room_id.clone();
        }
        if let Some(enabled) = self.enabled {
            job.enabled = enabled;
        }
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(max_failures) = self.max_failures {
            job.max_failures = max_failures;
        }
        if let Some(next_run_at) = self.next_run_at {
            job.next_run_at = next_run_at;
        }
        job.normalize_schedule();
        job.updated_at = now;
    }
}

/// Filter for listing jobs. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl JobFilter {
    pub fn matches(&self, job: &AgentJob) -> bool {
        self.agent_id.as_deref().is_none_or(|a| a == job.agent_id)
            && self.status.is_none_or(|s| s == job.status)
            && self.enabled.is_none_or(|e| e == job.enabled)
    }
}

// ──────────────────── Run Types ────────────────────

/// One execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentJobRun {
    pub id: String,
    pub job_id: String,
    pub tenant_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub payload_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AgentJobRun {
    /// Move a running run into its terminal state.
    pub fn finish(
        &mut self,
        status: RunStatus,
        completed_at: DateTime<Utc>,
        error: Option<String>,
        message_id: Option<String>,
    ) {
        self.status = status;
        self.completed_at = Some(completed_at);
        self.duration_ms = Some(policy::run_duration_ms(self.started_at, completed_at));
        self.error = error;
        self.message_id = message_id;
    }
}

/// Outcome report for a run, as submitted by the worker that executed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRunInput {
    pub job_id: String,
    pub run_id: String,
    pub status: RunStatus,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Next due time, computed by the caller. `None` leaves the job unscheduled.
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    /// Mark the whole job `completed` (e.g. a one-off job that has fired).
    #[serde(default)]
    pub complete_job: bool,
}
