//! Worker loop: lease due jobs, execute them, report outcomes, and run the
//! periodic reaper and retention sweeps.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use agentjobs_config::{ConfigError, SchedulerConfig};
use agentjobs_store::{JobRepository, Result};
use agentjobs_types::{AgentJob, AgentJobPatch, CompleteRunInput, RunStatus};

use crate::advance::{Advance, ScheduleAdvancer};
use crate::executor::{ExecutionOutcome, JobExecutor};
use crate::service::JobScheduler;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub pickup_limit: usize,
    pub concurrency: usize,
    pub poll_interval: std::time::Duration,
    pub stale_after: Duration,
    pub reap_interval: std::time::Duration,
    pub max_runs_per_job: usize,
    pub prune_interval: std::time::Duration,
}

impl TryFrom<&SchedulerConfig> for WorkerSettings {
    type Error = ConfigError;

    fn try_from(config: &SchedulerConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let stale_after = i64::try_from(config.reaper.stale_after_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| ConfigError::Invalid {
                field: "reaper.stale_after_secs",
                message: "is out of range".to_string(),
            })?;
        Ok(Self {
            pickup_limit: config.worker.pickup_limit,
            concurrency: config.worker.concurrency,
            poll_interval: std::time::Duration::from_secs(config.worker.poll_interval_secs),
            stale_after,
            reap_interval: std::time::Duration::from_secs(config.reaper.interval_secs),
            max_runs_per_job: config.retention.max_runs_per_job,
            prune_interval: std::time::Duration::from_secs(config.retention.interval_secs),
        })
    }
}

/// Counts from one pickup tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub leased: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Jobs that reached `completed` on this tick.
    pub finished: usize,
    /// Leased jobs whose run could not be opened or closed.
    pub abandoned: usize,
}

enum JobResult {
    Reported { status: RunStatus, finished: bool },
    Abandoned,
}

pub struct Worker<R: JobRepository> {
    scheduler: JobScheduler<R>,
    executor: Arc<dyn JobExecutor>,
    advancer: Arc<dyn ScheduleAdvancer>,
    settings: WorkerSettings,
}

impl<R: JobRepository + 'static> Worker<R> {
    pub fn new(
        scheduler: JobScheduler<R>,
        executor: Arc<dyn JobExecutor>,
        advancer: Arc<dyn ScheduleAdvancer>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            scheduler,
            executor,
            advancer,
            settings,
        }
    }

    /// Lease everything due at `now` and process it, at most
    /// `concurrency` jobs at a time.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let jobs = self.scheduler.pickup_due(self.settings.pickup_limit, now).await?;
        let mut report = TickReport {
            leased: jobs.len(),
            ..Default::default()
        };
        if jobs.is_empty() {
            return Ok(report);
        }

        let results: Vec<JobResult> = futures::stream::iter(jobs)
            .map(|job| self.process(job, now))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                JobResult::Reported { status, finished } => {
                    if status.is_failure() {
                        report.failed += 1;
                    } else {
                        report.succeeded += 1;
                    }
                    if finished {
                        report.finished += 1;
                    }
                }
                JobResult::Abandoned => report.abandoned += 1,
            }
        }
        info!(
            leased = report.leased,
            succeeded = report.succeeded,
            failed = report.failed,
            abandoned = report.abandoned,
            "Worker tick done"
        );
        Ok(report)
    }

    async fn process(&self, job: AgentJob, now: DateTime<Utc>) -> JobResult {
        let run = match self
            .scheduler
            .start_run(&job.tenant_id, &job.id, &job.payload_text, now)
            .await
        {
            Ok(run) => run,
            Err(e) => {
                warn!(job_id = %job.id, "Failed to start run: {e}");
                self.reschedule(&job, now).await;
                return JobResult::Abandoned;
            }
        };

        let started = Instant::now();
        let outcome = match self.executor.execute(&job, &run).await {
            Ok(outcome) if outcome.status.is_terminal() => outcome,
            Ok(outcome) => ExecutionOutcome::failed(format!(
                "executor returned non-terminal status {}",
                outcome.status
            )),
            Err(e) => ExecutionOutcome::failed(format!("{e:#}")),
        };
        let elapsed = Duration::from_std(started.elapsed()).unwrap_or(Duration::zero());
        let completed_at = now + elapsed;

        let (next_run_at, complete_job) = match self.advancer.next_run_after(&job, completed_at) {
            Advance::At(next) => (Some(next), false),
            Advance::Finished => (None, true),
            Advance::Unscheduled => (None, false),
        };

        let input = CompleteRunInput {
            job_id: job.id.clone(),
            run_id: run.id.clone(),
            status: outcome.status,
            completed_at,
            message_id: outcome.message_id,
            error: outcome.error,
            next_run_at,
            complete_job,
        };
        match self.scheduler.complete_run(&job.tenant_id, &input).await {
            Ok(updated) => JobResult::Reported {
                status: input.status,
                finished: updated.status == agentjobs_types::JobStatus::Completed,
            },
            Err(e) => {
                // The run stays `running`; the reaper closes it later.
                warn!(job_id = %job.id, run_id = %run.id, "Failed to complete run: {e}");
                JobResult::Abandoned
            }
        }
    }

    /// Put a leased job back on its schedule after a run could not be opened.
    async fn reschedule(&self, job: &AgentJob, now: DateTime<Utc>) {
        let Advance::At(next) = self.advancer.next_run_after(job, now) else {
            return;
        };
        let patch = AgentJobPatch {
            next_run_at: Some(Some(next)),
            ..Default::default()
        };
        if let Err(e) = self.scheduler.update_job(&job.tenant_id, &job.id, &patch, now).await {
            warn!(job_id = %job.id, "Failed to reschedule job: {e}");
        }
    }

    /// Close runs stuck in `running` longer than the configured threshold.
    pub async fn reap(&self, now: DateTime<Utc>) -> Result<usize> {
        let reclaimed = self
            .scheduler
            .cleanup_stale_runs(self.settings.stale_after, now)
            .await?;
        if reclaimed > 0 {
            warn!(reclaimed, "Reclaimed stale runs");
        }
        Ok(reclaimed)
    }

    pub async fn prune(&self) -> Result<usize> {
        self.scheduler.prune_all(self.settings.max_runs_per_job).await
    }

    /// Run pickup, reaper and retention on their own intervals until
    /// `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            poll_secs = self.settings.poll_interval.as_secs_f64(),
            concurrency = self.settings.concurrency,
            "Worker started"
        );
        let mut poll = tokio::time::interval(self.settings.poll_interval);
        let mut reap = tokio::time::interval(self.settings.reap_interval);
        let mut prune = tokio::time::interval(self.settings.prune_interval);
        for timer in [&mut poll, &mut reap, &mut prune] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!("Pickup failed: {e}");
                    }
                }
                _ = reap.tick() => {
                    if let Err(e) = self.reap(Utc::now()).await {
                        error!("Stale run cleanup failed: {e}");
                    }
                }
                _ = prune.tick() => {
                    if let Err(e) = self.prune().await {
                        error!("Run history pruning failed: {e}");
                    }
                }
            }
        }
        info!("Worker stopped");
    }
}
