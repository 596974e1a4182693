//! `JobScheduler`: the entry point collaborators use to manage jobs and
//! report runs.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use agentjobs_config::JobDefaults;
use agentjobs_store::{JobRepository, Result};
use agentjobs_types::{
    AgentJob, AgentJobPatch, AgentJobRun, CompleteRunInput, JobFilter, JobStatus, NewAgentJob,
};

/// Job registry, leaser, run lifecycle and maintenance operations over a
/// [`JobRepository`].
pub struct JobScheduler<R: JobRepository> {
    repo: Arc<R>,
    defaults: JobDefaults,
}

impl<R: JobRepository> Clone for JobScheduler<R> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
            defaults: self.defaults.clone(),
        }
    }
}

impl<R: JobRepository> JobScheduler<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self::with_defaults(repo, JobDefaults::default())
    }

    pub fn with_defaults(repo: Arc<R>, defaults: JobDefaults) -> Self {
        Self { repo, defaults }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    // ─── Job Registry ───────────────────────────────────

    pub async fn register_agent(&self, tenant_id: &str, agent_id: &str, name: &str) -> Result<()> {
        self.repo.register_agent(tenant_id, agent_id, name).await
    }

    /// Create a job, filling unset timezone and failure budget from the
    /// configured defaults.
    pub async fn create_job(
        &self,
        tenant_id: &str,
        mut input: NewAgentJob,
        now: DateTime<Utc>,
    ) -> Result<AgentJob> {
        if input.timezone.is_none() {
            input.timezone = Some(self.defaults.timezone.clone());
        }
        if input.max_failures.is_none() {
            input.max_failures = Some(self.defaults.max_failures);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let job = input.into_job(id, tenant_id.to_string(), now);
        let job = self.repo.create_job(job).await?;
        info!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            agent_id = %job.agent_id,
            schedule = %job.schedule_kind,
            "Created agent job"
        );
        Ok(job)
    }

    pub async fn get_job(&self, tenant_id: &str, job_id: &str) -> Result<AgentJob> {
        self.repo.get_job(tenant_id, job_id).await
    }

    pub async fn update_job(
        &self,
        tenant_id: &str,
        job_id: &str,
        patch: &AgentJobPatch,
        now: DateTime<Utc>,
    ) -> Result<AgentJob> {
        if patch.is_empty() {
            return self.repo.get_job(tenant_id, job_id).await;
        }
        let job = self.repo.update_job(tenant_id, job_id, patch, now).await?;
        info!(job_id = %job.id, status = %job.status, enabled = job.enabled, "Updated agent job");
        Ok(job)
    }

    pub async fn delete_job(&self, tenant_id: &str, job_id: &str) -> Result<()> {
        self.repo.delete_job(tenant_id, job_id).await?;
        info!(job_id, tenant_id, "Deleted agent job");
        Ok(())
    }

    pub async fn list_jobs(&self, tenant_id: &str, filter: &JobFilter) -> Result<Vec<AgentJob>> {
        self.repo.list_jobs(tenant_id, filter).await
    }

    pub async fn pause_job(
        &self,
        tenant_id: &str,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AgentJob> {
        let patch = AgentJobPatch {
            status: Some(JobStatus::Paused),
            ..Default::default()
        };
        self.update_job(tenant_id, job_id, &patch, now).await
    }

    /// Reactivate a job and schedule it at `next_run_at`. Failure counters are
    /// left alone; only a successful run resets them.
    pub async fn resume_job(
        &self,
        tenant_id: &str,
        job_id: &str,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<AgentJob> {
        let patch = AgentJobPatch {
            status: Some(JobStatus::Active),
            next_run_at: Some(Some(next_run_at)),
            ..Default::default()
        };
        self.update_job(tenant_id, job_id, &patch, now).await
    }

    pub async fn set_enabled(
        &self,
        tenant_id: &str,
        job_id: &str,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<AgentJob> {
        let patch = AgentJobPatch {
            enabled: Some(enabled),
            ..Default::default()
        };
        self.update_job(tenant_id, job_id, &patch, now).await
    }

    /// Make a job due immediately.
    pub async fn run_now(
        &self,
        tenant_id: &str,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AgentJob> {
        let patch = AgentJobPatch {
            next_run_at: Some(Some(now)),
            ..Default::default()
        };
        self.update_job(tenant_id, job_id, &patch, now).await
    }

    // ─── Leasing and runs ───────────────────────────────────

    pub async fn pickup_due(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<AgentJob>> {
        let jobs = self.repo.pickup_due(limit, now).await?;
        for job in &jobs {
            debug!(job_id = %job.id, tenant_id = %job.tenant_id, "Leased job");
        }
        Ok(jobs)
    }

    pub async fn start_run(
        &self,
        tenant_id: &str,
        job_id: &str,
        payload_text: &str,
        started_at: DateTime<Utc>,
    ) -> Result<AgentJobRun> {
        let run = self
            .repo
            .start_run(tenant_id, job_id, payload_text, started_at)
            .await?;
        debug!(job_id, run_id = %run.id, "Started run");
        Ok(run)
    }

    pub async fn complete_run(
        &self,
        tenant_id: &str,
        input: &CompleteRunInput,
    ) -> Result<AgentJob> {
        let job = self.repo.complete_run(tenant_id, input).await?;
        if input.status.is_failure() {
            warn!(
                job_id = %job.id,
                run_id = %input.run_id,
                status = %input.status,
                consecutive_failures = job.consecutive_failures,
                error = input.error.as_deref().unwrap_or(""),
                "Run failed"
            );
            if job.status == JobStatus::Paused && job.consecutive_failures == job.max_failures {
                warn!(
                    job_id = %job.id,
                    max_failures = job.max_failures,
                    "Job paused after repeated failures"
                );
            }
        } else {
            debug!(
                job_id = %job.id,
                run_id = %input.run_id,
                status = %input.status,
                "Run completed"
            );
        }
        if job.status == JobStatus::Completed {
            info!(job_id = %job.id, "Job completed");
        }
        Ok(job)
    }

    pub async fn get_run(&self, tenant_id: &str, run_id: &str) -> Result<AgentJobRun> {
        self.repo.get_run(tenant_id, run_id).await
    }

    pub async fn list_runs(
        &self,
        tenant_id: &str,
        job_id: &str,
        limit: usize,
    ) -> Result<Vec<AgentJobRun>> {
        self.repo.list_runs(tenant_id, job_id, limit).await
    }

    // ─── Maintenance ───────────────────────────────────

    pub async fn prune_run_history(
        &self,
        tenant_id: &str,
        job_id: &str,
        max_runs: usize,
    ) -> Result<usize> {
        self.repo.prune_run_history(tenant_id, job_id, max_runs).await
    }

    /// Prune every job holding more than `max_runs` runs. Failures on one job
    /// are logged and do not stop the sweep.
    pub async fn prune_all(&self, max_runs: usize) -> Result<usize> {
        let mut deleted = 0;
        for (tenant_id, job_id) in self.repo.jobs_exceeding_history(max_runs).await? {
            match self.repo.prune_run_history(&tenant_id, &job_id, max_runs).await {
                Ok(n) => deleted += n,
                Err(e) => warn!(job_id = %job_id, "Failed to prune run history: {e}"),
            }
        }
        if deleted > 0 {
            info!(deleted, "Pruned run history");
        }
        Ok(deleted)
    }

    pub async fn cleanup_stale_runs(
        &self,
        older_than: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.repo.cleanup_stale_runs(older_than, now).await
    }
}
