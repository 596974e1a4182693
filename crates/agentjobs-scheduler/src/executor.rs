//! Executing a leased job's payload.
//!
//! The scheduler only records that a run happened and how it ended. Delivery
//! goes through two external collaborators: a room provisioner that lazily
//! creates a room for a job, and a message sink that records the payload as a
//! chat message.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use agentjobs_store::JobRepository;
use agentjobs_types::{AgentJob, AgentJobPatch, AgentJobRun, PayloadKind, RunStatus};

/// What an execution produced, reported back through `complete_run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: RunStatus,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn success(message_id: Option<String>) -> Self {
        Self {
            status: RunStatus::Success,
            message_id,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            message_id: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Carry out one run. An `Err` is recorded as a failed run.
    async fn execute(&self, job: &AgentJob, run: &AgentJobRun) -> anyhow::Result<ExecutionOutcome>;
}

/// Creates (or finds) the communication room a job posts into.
#[async_trait]
pub trait RoomProvisioner: Send + Sync {
    async fn ensure_room(&self, job: &AgentJob) -> anyhow::Result<String>;
}

/// A message the scheduler asks the chat service to record.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMessage {
    pub tenant_id: String,
    pub agent_id: String,
    pub job_id: String,
    pub run_id: String,
    pub text: String,
    /// `true` for `system_event` payloads.
    pub system: bool,
}

/// Records messages; returns the created message id.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn post(&self, room_id: &str, message: &OutgoingMessage) -> anyhow::Result<String>;
}

/// Default executor: deliver the payload as a chat message into the job's room.
pub struct ChatJobExecutor<R: JobRepository> {
    repo: Arc<R>,
    rooms: Arc<dyn RoomProvisioner>,
    messages: Arc<dyn MessageSink>,
}

impl<R: JobRepository> ChatJobExecutor<R> {
    pub fn new(
        repo: Arc<R>,
        rooms: Arc<dyn RoomProvisioner>,
        messages: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            repo,
            rooms,
            messages,
        }
    }

    async fn room_for(&self, job: &AgentJob) -> anyhow::Result<String> {
        if let Some(room_id) = &job.room_id {
            return Ok(room_id.clone());
        }
        let room_id = self.rooms.ensure_room(job).await?;
        let patch = AgentJobPatch {
            room_id: Some(Some(room_id.clone())),
            ..Default::default()
        };
        self.repo
            .update_job(&job.tenant_id, &job.id, &patch, Utc::now())
            .await?;
        info!(job_id = %job.id, room_id = %room_id, "Provisioned room for job");
        Ok(room_id)
    }
}

#[async_trait]
impl<R: JobRepository> JobExecutor for ChatJobExecutor<R> {
    async fn execute(&self, job: &AgentJob, run: &AgentJobRun) -> anyhow::Result<ExecutionOutcome> {
        let room_id = self.room_for(job).await?;
        let message = OutgoingMessage {
            tenant_id: job.tenant_id.clone(),
            agent_id: job.agent_id.clone(),
            job_id: job.id.clone(),
            run_id: run.id.clone(),
            text: run.payload_text.clone(),
            system: job.payload_kind == PayloadKind::SystemEvent,
        };
        let message_id = self.messages.post(&room_id, &message).await?;
        debug!(job_id = %job.id, run_id = %run.id, message_id = %message_id, "Posted job message");
        Ok(ExecutionOutcome::success(Some(message_id)))
    }
}
