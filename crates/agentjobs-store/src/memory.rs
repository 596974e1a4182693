//! In-memory job store.
//!
//! One async mutex guards all state, so every operation is its own
//! transaction and the leasing and completion rules of the SQLite store hold
//! trivially.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use agentjobs_types::policy::{STALE_RUN_ERROR, run_duration_ms, stale_cutoff};
use agentjobs_types::validate::{validate_completion, validate_job, validate_payload};
use agentjobs_types::{
    AgentJob, AgentJobPatch, AgentJobRun, CompleteRunInput, JobFilter, JobStatus, MAX_LIST_JOBS,
    RunStatus,
};

use crate::error::{JobError, Result};
use crate::{JobRepository, MAX_LIST_RUNS};

#[derive(Default)]
struct State {
    /// agent id -> tenant id
    agents: HashMap<String, String>,
    jobs: HashMap<String, AgentJob>,
    runs: HashMap<String, AgentJobRun>,
}

impl State {
    fn job(&self, tenant_id: &str, job_id: &str) -> Result<&AgentJob> {
        self.jobs
            .get(job_id)
            .filter(|j| j.tenant_id == tenant_id)
            .ok_or_else(|| JobError::not_found("job", job_id))
    }

    fn job_mut(&mut self, tenant_id: &str, job_id: &str) -> Result<&mut AgentJob> {
        self.jobs
            .get_mut(job_id)
            .filter(|j| j.tenant_id == tenant_id)
            .ok_or_else(|| JobError::not_found("job", job_id))
    }

    fn run(&self, tenant_id: &str, run_id: &str) -> Result<&AgentJobRun> {
        self.runs
            .get(run_id)
            .filter(|r| r.tenant_id == tenant_id)
            .ok_or_else(|| JobError::not_found("run", run_id))
    }

    /// Runs of one job, most recently started first.
    fn runs_for(&self, job_id: &str) -> Vec<&AgentJobRun> {
        let mut runs: Vec<_> = self.runs.values().filter(|r| r.job_id == job_id).collect();
        runs.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        runs
    }
}

/// Job store kept entirely in process memory.
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobStore {
    async fn register_agent(&self, tenant_id: &str, agent_id: &str, _name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| tenant_id.to_string());
        Ok(())
    }

    async fn create_job(&self, job: AgentJob) -> Result<AgentJob> {
        validate_job(&job)?;
        let mut state = self.state.lock().await;
        if state.agents.get(&job.agent_id) != Some(&job.tenant_id) {
            return Err(JobError::not_found("agent", job.agent_id));
        }
        if state.jobs.contains_key(&job.id) {
            return Err(JobError::Conflict(format!("job {} already exists", job.id)));
        }
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get_job(&self, tenant_id: &str, job_id: &str) -> Result<AgentJob> {
        let state = self.state.lock().await;
        state.job(tenant_id, job_id).cloned()
    }

    async fn update_job(
        &self,
        tenant_id: &str,
        job_id: &str,
        patch: &AgentJobPatch,
        now: DateTime<Utc>,
    ) -> Result<AgentJob> {
        let mut state = self.state.lock().await;
        let mut job = state.job(tenant_id, job_id)?.clone();
        patch.apply(&mut job, now);
        validate_job(&job)?;
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn delete_job(&self, tenant_id: &str, job_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.job(tenant_id, job_id)?;
        state.jobs.remove(job_id);
        state.runs.retain(|_, r| r.job_id != job_id);
        Ok(())
    }

    async fn list_jobs(&self, tenant_id: &str, filter: &JobFilter) -> Result<Vec<AgentJob>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs.truncate(MAX_LIST_JOBS);
        Ok(jobs)
    }

    async fn pickup_due(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<AgentJob>> {
        let mut state = self.state.lock().await;
        let mut due: Vec<(DateTime<Utc>, DateTime<Utc>, String)> = state
            .jobs
            .values()
            .filter(|j| j.enabled && j.status == JobStatus::Active)
            .filter_map(|j| {
                j.next_run_at
                    .filter(|next| *next <= now)
                    .map(|next| (next, j.created_at, j.id.clone()))
            })
            .collect();
        due.sort();
        due.truncate(limit);

        let mut leased = Vec::with_capacity(due.len());
        for (_, _, job_id) in due {
            if let Some(job) = state.jobs.get_mut(&job_id) {
                job.next_run_at = None;
                job.updated_at = now;
                leased.push(job.clone());
            }
        }
        if !leased.is_empty() {
            debug!(count = leased.len(), "Leased due jobs");
        }
        Ok(leased)
    }

    async fn start_run(
        &self,
        tenant_id: &str,
        job_id: &str,
        payload_text: &str,
        started_at: DateTime<Utc>,
    ) -> Result<AgentJobRun> {
        validate_payload(payload_text)?;
        let mut state = self.state.lock().await;
        let job = state.job(tenant_id, job_id)?;
        let run = AgentJobRun {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job.id.clone(),
            tenant_id: job.tenant_id.clone(),
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            duration_ms: None,
            error: None,
            payload_text: payload_text.to_string(),
            message_id: None,
            created_at: started_at,
        };
        state.runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn complete_run(&self, tenant_id: &str, input: &CompleteRunInput) -> Result<AgentJob> {
        validate_completion(input)?;
        let mut state = self.state.lock().await;
        let mut run = state.run(tenant_id, &input.run_id)?.clone();
        if run.job_id != input.job_id {
            return Err(JobError::not_found("run", &input.run_id));
        }
        if run.status != RunStatus::Running {
            return Err(JobError::Conflict(format!(
                "run {} already completed with status {}",
                run.id, run.status
            )));
        }
        // Stage both rows before writing either so a missing job leaves the run running.
        let mut job = state.job(tenant_id, &input.job_id)?.clone();
        run.finish(
            input.status,
            input.completed_at,
            input.error.clone(),
            input.message_id.clone(),
        );
        job.record_completion(&run, input);

        state.runs.insert(run.id.clone(), run);
        *state.job_mut(tenant_id, &input.job_id)? = job.clone();
        Ok(job)
    }

    async fn get_run(&self, tenant_id: &str, run_id: &str) -> Result<AgentJobRun> {
        let state = self.state.lock().await;
        state.run(tenant_id, run_id).cloned()
    }

    async fn list_runs(
        &self,
        tenant_id: &str,
        job_id: &str,
        limit: usize,
    ) -> Result<Vec<AgentJobRun>> {
        let state = self.state.lock().await;
        state.job(tenant_id, job_id)?;
        Ok(state
            .runs_for(job_id)
            .into_iter()
            .take(limit.min(MAX_LIST_RUNS))
            .cloned()
            .collect())
    }

    async fn prune_run_history(
        &self,
        tenant_id: &str,
        job_id: &str,
        max_runs: usize,
    ) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.job(tenant_id, job_id)?;
        let doomed: Vec<String> = state
            .runs_for(job_id)
            .into_iter()
            .skip(max_runs)
            .map(|r| r.id.clone())
            .collect();
        for id in &doomed {
            state.runs.remove(id);
        }
        Ok(doomed.len())
    }

    async fn jobs_exceeding_history(&self, max_runs: usize) -> Result<Vec<(String, String)>> {
        let state = self.state.lock().await;
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for run in state.runs.values() {
            *counts.entry(run.job_id.as_str()).or_default() += 1;
        }
        let mut over: Vec<&AgentJob> = counts
            .into_iter()
            .filter(|(_, n)| *n > max_runs)
            .filter_map(|(job_id, _)| state.jobs.get(job_id))
            .collect();
        over.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(over
            .into_iter()
            .map(|j| (j.tenant_id.clone(), j.id.clone()))
            .collect())
    }

    async fn cleanup_stale_runs(&self, older_than: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = stale_cutoff(older_than, now)?;
        let mut state = self.state.lock().await;

        let mut per_job: BTreeMap<String, i64> = BTreeMap::new();
        for run in state.runs.values_mut() {
            if run.status == RunStatus::Running && run.started_at < cutoff {
                run.status = RunStatus::Timeout;
                run.completed_at = Some(now);
                run.duration_ms = Some(run_duration_ms(run.started_at, now));
                run.error = Some(STALE_RUN_ERROR.to_string());
                *per_job.entry(run.job_id.clone()).or_default() += 1;
            }
        }

        let mut reclaimed = 0usize;
        for (job_id, count) in &per_job {
            reclaimed += *count as usize;
            if let Some(job) = state.jobs.get_mut(job_id) {
                let previous = job.status;
                job.record_stale_runs(*count, now);
                if previous != job.status && job.status == JobStatus::Paused {
                    info!(
                        job_id = %job.id,
                        tenant_id = %job.tenant_id,
                        "Job paused after stale runs"
                    );
                }
            }
        }
        if reclaimed > 0 {
            info!(reclaimed, jobs = per_job.len(), "Reclaimed stale runs");
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;
    use std::sync::Arc;

    fn store() -> InMemoryJobStore {
        InMemoryJobStore::new()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        conformance::create_and_get(&store()).await;
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_agent() {
        conformance::create_rejects_unknown_agent(&store()).await;
    }

    #[tokio::test]
    async fn test_create_validation() {
        conformance::create_validation(&store()).await;
    }

    #[tokio::test]
    async fn test_update_revalidates() {
        conformance::update_revalidates(&store()).await;
    }

    #[tokio::test]
    async fn test_delete() {
        conformance::delete(&store()).await;
    }

    #[tokio::test]
    async fn test_list_filters_and_order() {
        conformance::list_filters_and_order(&store()).await;
    }

    #[tokio::test]
    async fn test_cross_tenant_is_not_found() {
        conformance::cross_tenant_is_not_found(&store()).await;
    }

    #[tokio::test]
    async fn test_pickup_due_leases_once() {
        conformance::pickup_due_leases_once(&store()).await;
    }

    #[tokio::test]
    async fn test_pickup_due_order_and_limit() {
        conformance::pickup_due_order_and_limit(&store()).await;
    }

    #[tokio::test]
    async fn test_interval_scenario() {
        conformance::interval_scenario(&store()).await;
    }

    #[tokio::test]
    async fn test_complete_run_twice_conflicts() {
        conformance::complete_run_twice_conflicts(&store()).await;
    }

    #[tokio::test]
    async fn test_failures_pause_job() {
        conformance::failures_pause_job(&store()).await;
    }

    #[tokio::test]
    async fn test_start_run_errors() {
        conformance::start_run_errors(&store()).await;
    }

    #[tokio::test]
    async fn test_cleanup_stale_runs() {
        conformance::cleanup_stale_runs(&store()).await;
    }

    #[tokio::test]
    async fn test_cleanup_stale_runs_escalates() {
        conformance::cleanup_stale_runs_escalates(&store()).await;
    }

    #[tokio::test]
    async fn test_prune_run_history() {
        conformance::prune_run_history(&store()).await;
    }

    #[tokio::test]
    async fn test_create_duplicate_id_conflicts() {
        conformance::create_duplicate_id_conflicts(&store()).await;
    }

    #[tokio::test]
    async fn test_cleanup_rejects_bad_threshold() {
        conformance::cleanup_rejects_bad_threshold(&store()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_pickup_is_disjoint() {
        let store = Arc::new(store());
        store.register_agent("t1", "agent-1", "Agent").await.unwrap();
        let now = conformance::t0();
        for i in 0..50 {
            let due = now - Duration::seconds(i);
            let job = conformance::interval_job("t1", &format!("job-{i:02}"), due);
            store.create_job(job).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.pickup_due(10, now).await.unwrap() }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.extend(handle.await.unwrap().into_iter().map(|j| j.id));
        }
        assert_eq!(ids.len(), 50);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 50);
    }
}
