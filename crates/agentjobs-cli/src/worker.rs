//! `worker` subcommand.
//!
//! The standalone binary has no chat service to talk to, so rooms and
//! messages are only logged.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use agentjobs_config::SchedulerConfig;
use agentjobs_scheduler::{
    ChatJobExecutor, FixedScheduleAdvancer, JobScheduler, MessageSink, OutgoingMessage,
    RoomProvisioner, Worker, WorkerSettings,
};
use agentjobs_store::SqliteJobStore;
use agentjobs_types::AgentJob;

struct LogRooms;

#[async_trait]
impl RoomProvisioner for LogRooms {
    async fn ensure_room(&self, job: &AgentJob) -> anyhow::Result<String> {
        let room_id = format!("job-{}", job.id);
        info!(job_id = %job.id, agent_id = %job.agent_id, room_id = %room_id, "Room provisioned");
        Ok(room_id)
    }
}

struct LogSink;

#[async_trait]
impl MessageSink for LogSink {
    async fn post(&self, room_id: &str, message: &OutgoingMessage) -> anyhow::Result<String> {
        let message_id = uuid::Uuid::new_v4().to_string();
        info!(
            room_id,
            message_id = %message_id,
            job_id = %message.job_id,
            system = message.system,
            text = %message.text,
            "Message posted"
        );
        Ok(message_id)
    }
}

pub async fn run_worker(
    scheduler: JobScheduler<SqliteJobStore>,
    config: &SchedulerConfig,
    once: bool,
) -> anyhow::Result<()> {
    let executor = ChatJobExecutor::new(
        scheduler.repository().clone(),
        Arc::new(LogRooms),
        Arc::new(LogSink),
    );
    let worker = Arc::new(Worker::new(
        scheduler,
        Arc::new(executor),
        Arc::new(FixedScheduleAdvancer::new()),
        WorkerSettings::try_from(config)?,
    ));

    if once {
        let report = worker.tick(Utc::now()).await?;
        println!(
            "Leased {}, succeeded {}, failed {}, abandoned {}",
            report.leased, report.succeeded, report.failed, report.abandoned
        );
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(worker.run(cancel.clone()));
    tokio::signal::ctrl_c().await?;
    info!("Shutting down worker");
    cancel.cancel();
    handle.await?;
    Ok(())
}
