//! agentjobs-scheduler: the facade and worker around a [`JobRepository`].
//!
//! [`JobScheduler`] exposes registry, run lifecycle and maintenance
//! operations. [`Worker`] drives due jobs through a [`JobExecutor`] and asks
//! a [`ScheduleAdvancer`] where each job goes next.
//!
//! [`JobRepository`]: agentjobs_store::JobRepository

pub mod advance;
pub mod executor;
pub mod service;
pub mod worker;

pub use advance::{Advance, CronEvaluator, FixedScheduleAdvancer, ScheduleAdvancer};
pub use executor::{
    ChatJobExecutor, ExecutionOutcome, JobExecutor, MessageSink, OutgoingMessage, RoomProvisioner,
};
pub use service::JobScheduler;
pub use worker::{TickReport, Worker, WorkerSettings};
