//! agentjobs-store: durable storage for agent jobs and their runs.
//!
//! [`JobRepository`] is the single synchronization point between workers.
//! [`SqliteJobStore`] is the production backend; [`InMemoryJobStore`] keeps
//! the same invariants (single-claim pickup, single completion per run) for
//! tests and embedded use.

pub mod error;
pub mod memory;
pub mod sqlite;

#[cfg(test)]
mod conformance;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use agentjobs_types::{AgentJob, AgentJobPatch, AgentJobRun, CompleteRunInput, JobFilter};

pub use error::{ErrorKind, JobError, Result};
pub use memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;

/// Upper bound on runs returned by one `list_runs` call.
pub const MAX_LIST_RUNS: usize = 500;

/// Storage operations behind the scheduler.
///
/// Registry and run operations are scoped to a tenant; an id owned by another
/// tenant is reported as not found. `pickup_due` and `cleanup_stale_runs` span
/// all tenants because the worker pool is shared.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Record an agent so jobs can reference it.
    async fn register_agent(&self, tenant_id: &str, agent_id: &str, name: &str) -> Result<()>;

    /// Validate and insert a fully built job. Unknown agent is `NotFound`.
    async fn create_job(&self, job: AgentJob) -> Result<AgentJob>;

    async fn get_job(&self, tenant_id: &str, job_id: &str) -> Result<AgentJob>;

    /// Apply `patch`, re-validate the merged record and persist it.
    async fn update_job(
        &self,
        tenant_id: &str,
        job_id: &str,
        patch: &AgentJobPatch,
        now: DateTime<Utc>,
    ) -> Result<AgentJob>;

    /// Hard delete. Run history goes with the job.
    async fn delete_job(&self, tenant_id: &str, job_id: &str) -> Result<()>;

    /// Oldest-created first, capped at [`agentjobs_types::MAX_LIST_JOBS`].
    async fn list_jobs(&self, tenant_id: &str, filter: &JobFilter) -> Result<Vec<AgentJob>>;

    /// Lease up to `limit` due jobs, clearing their `next_run_at`. Each due
    /// job is handed to exactly one caller.
    async fn pickup_due(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<AgentJob>>;

    /// Open a `running` run for a job, inheriting the job's tenant.
    async fn start_run(
        &self,
        tenant_id: &str,
        job_id: &str,
        payload_text: &str,
        started_at: DateTime<Utc>,
    ) -> Result<AgentJobRun>;

    /// Close a running run and fold its outcome into the job atomically.
    /// A run that is no longer `running` yields `Conflict`.
    async fn complete_run(&self, tenant_id: &str, input: &CompleteRunInput) -> Result<AgentJob>;

    async fn get_run(&self, tenant_id: &str, run_id: &str) -> Result<AgentJobRun>;

    /// Most recent runs first, capped at [`MAX_LIST_RUNS`].
    async fn list_runs(&self, tenant_id: &str, job_id: &str, limit: usize)
    -> Result<Vec<AgentJobRun>>;

    /// Keep the `max_runs` most recent runs of a job; returns rows deleted.
    async fn prune_run_history(&self, tenant_id: &str, job_id: &str, max_runs: usize)
    -> Result<usize>;

    /// `(tenant_id, job_id)` of every job holding more than `max_runs` runs.
    async fn jobs_exceeding_history(&self, max_runs: usize) -> Result<Vec<(String, String)>>;

    /// Time out runs left `running` longer than `older_than`; returns the
    /// number reclaimed.
    async fn cleanup_stale_runs(&self, older_than: Duration, now: DateTime<Utc>) -> Result<usize>;
}
