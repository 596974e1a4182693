//! `agent` and `jobs` subcommands.

use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};

use agentjobs_scheduler::JobScheduler;
use agentjobs_store::SqliteJobStore;
use agentjobs_types::{
    AgentJobPatch, JobFilter, JobStatus, NewAgentJob, PayloadKind, ScheduleKind, ValidationError,
};

use crate::{parse_timestamp, print_json};

#[derive(Subcommand)]
pub enum AgentCommand {
    /// Register an agent so jobs can target it
    Add {
        agent_id: String,

        #[arg(short, long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum JobsCommand {
    /// List jobs
    List {
        #[arg(long)]
        agent: Option<String>,

        /// active, paused, completed or failed
        #[arg(long)]
        status: Option<JobStatus>,

        #[arg(long)]
        enabled: Option<bool>,
    },
    /// Show one job
    Show { job_id: String },
    /// Create a job
    Add(AddJob),
    /// Change fields of a job
    Update(UpdateJob),
    /// Delete a job and its run history
    Rm { job_id: String },
    /// Stop scheduling a job
    Pause { job_id: String },
    /// Reactivate a job
    Resume {
        job_id: String,

        /// When to run next (RFC 3339, defaults to now)
        #[arg(long, value_parser = parse_timestamp)]
        at: Option<DateTime<Utc>>,
    },
    /// Make a job due immediately
    RunNow { job_id: String },
}

#[derive(Args)]
pub struct AddJob {
    #[arg(long)]
    agent: String,

    #[arg(long)]
    name: String,

    #[arg(long)]
    description: Option<String>,

    /// Cron expression
    #[arg(long, conflicts_with_all = ["every_secs", "at"])]
    cron: Option<String>,

    /// Repeat every N seconds
    #[arg(long, conflicts_with = "at")]
    every_secs: Option<u64>,

    /// Run once at this time (RFC 3339)
    #[arg(long, value_parser = parse_timestamp)]
    at: Option<DateTime<Utc>>,

    /// First run (RFC 3339); defaults to now for repeating schedules
    #[arg(long, value_parser = parse_timestamp)]
    start: Option<DateTime<Utc>>,

    #[arg(long)]
    timezone: Option<String>,

    /// Text posted on each run
    #[arg(long)]
    text: String,

    /// Post as a system event instead of a message
    #[arg(long)]
    system: bool,

    #[arg(long)]
    room: Option<String>,

    #[arg(long)]
    max_failures: Option<i64>,

    /// Create the job disabled
    #[arg(long)]
    disabled: bool,
}

#[derive(Args)]
pub struct UpdateJob {
    job_id: String,

    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    description: Option<String>,

    #[arg(long)]
    text: Option<String>,

    #[arg(long, conflicts_with = "every_secs")]
    cron: Option<String>,

    #[arg(long)]
    every_secs: Option<u64>,

    #[arg(long)]
    timezone: Option<String>,

    #[arg(long)]
    room: Option<String>,

    #[arg(long)]
    enabled: Option<bool>,

    #[arg(long)]
    max_failures: Option<i64>,
}

/// Whole seconds to milliseconds, rejecting values that do not fit.
fn secs_to_ms(secs: u64) -> Result<i64, ValidationError> {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| secs.checked_mul(1000))
        .ok_or_else(|| ValidationError::new("interval_ms", "is out of range"))
}

impl AddJob {
    fn into_new_job(self, now: DateTime<Utc>) -> Result<NewAgentJob, ValidationError> {
        let schedule_kind = if self.cron.is_some() {
            ScheduleKind::Cron
        } else if self.every_secs.is_some() {
            ScheduleKind::Interval
        } else {
            ScheduleKind::Once
        };
        let next_run_at = match schedule_kind {
            ScheduleKind::Once => self.start,
            _ => Some(self.start.unwrap_or(now)),
        };
        let interval_ms = self.every_secs.map(secs_to_ms).transpose()?;
        Ok(NewAgentJob {
            agent_id: self.agent,
            name: self.name,
            description: self.description,
            schedule_kind,
            cron_expr: self.cron,
            interval_ms,
            run_at: self.at,
            timezone: self.timezone,
            payload_kind: if self.system {
                PayloadKind::SystemEvent
            } else {
                PayloadKind::Message
            },
            payload_text: self.text,
            room_id: self.room,
            enabled: Some(!self.disabled),
            max_failures: self.max_failures,
            next_run_at,
            created_by: Some("cli".to_string()),
        })
    }
}

impl UpdateJob {
    fn patch(&self) -> Result<AgentJobPatch, ValidationError> {
        let mut patch = AgentJobPatch {
            name: self.name.clone(),
            description: self.description.clone().map(Some),
            payload_text: self.text.clone(),
            timezone: self.timezone.clone(),
            room_id: self.room.clone().map(Some),
            enabled: self.enabled,
            max_failures: self.max_failures,
            ..Default::default()
        };
        if let Some(cron) = &self.cron {
            patch.schedule_kind = Some(ScheduleKind::Cron);
            patch.cron_expr = Some(Some(cron.clone()));
            patch.interval_ms = Some(None);
        } else if let Some(secs) = self.every_secs {
            patch.schedule_kind = Some(ScheduleKind::Interval);
            patch.interval_ms = Some(Some(secs_to_ms(secs)?));
            patch.cron_expr = Some(None);
        }
        Ok(patch)
    }
}

pub async fn run_agent(
    scheduler: &JobScheduler<SqliteJobStore>,
    tenant: &str,
    command: AgentCommand,
) -> anyhow::Result<()> {
    match command {
        AgentCommand::Add { agent_id, name } => {
            let name = name.unwrap_or_else(|| agent_id.clone());
            scheduler.register_agent(tenant, &agent_id, &name).await?;
            println!("Registered agent {agent_id}");
        }
    }
    Ok(())
}

pub async fn run_jobs(
    scheduler: &JobScheduler<SqliteJobStore>,
    tenant: &str,
    command: JobsCommand,
) -> anyhow::Result<()> {
    let now = Utc::now();
    match command {
        JobsCommand::List {
            agent,
            status,
            enabled,
        } => {
            let filter = JobFilter {
                agent_id: agent,
                status,
                enabled,
            };
            print_json(&scheduler.list_jobs(tenant, &filter).await?)?;
        }
        JobsCommand::Show { job_id } => {
            print_json(&scheduler.get_job(tenant, &job_id).await?)?;
        }
        JobsCommand::Add(args) => {
            let job = scheduler.create_job(tenant, args.into_new_job(now)?, now).await?;
            print_json(&job)?;
        }
        JobsCommand::Update(args) => {
            let job = scheduler
                .update_job(tenant, &args.job_id, &args.patch()?, now)
                .await?;
            print_json(&job)?;
        }
        JobsCommand::Rm { job_id } => {
            scheduler.delete_job(tenant, &job_id).await?;
            println!("Deleted job {job_id}");
        }
        JobsCommand::Pause { job_id } => {
            print_json(&scheduler.pause_job(tenant, &job_id, now).await?)?;
        }
        JobsCommand::Resume { job_id, at } => {
            let job = scheduler
                .resume_job(tenant, &job_id, at.unwrap_or(now), now)
                .await?;
            print_json(&job)?;
        }
        JobsCommand::RunNow { job_id } => {
            print_json(&scheduler.run_now(tenant, &job_id, now).await?)?;
        }
    }
    Ok(())
}
