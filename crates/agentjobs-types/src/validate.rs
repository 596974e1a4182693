//! Field validation for job records and run reports.

use thiserror::Error;

use crate::{AgentJob, CompleteRunInput, ScheduleKind};

/// A malformed or missing field. `field` names the offending attribute.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }

    fn required(field: &'static str) -> Self {
        Self::new(field, "is required")
    }
}

fn blank(value: &str) -> bool {
    value.trim().is_empty()
}

/// Check the invariants every persisted job must satisfy. Used on create and
/// again on the merged record after an update.
pub fn validate_job(job: &AgentJob) -> Result<(), ValidationError> {
    if blank(&job.agent_id) {
        return Err(ValidationError::required("agent_id"));
    }
    if blank(&job.name) {
        return Err(ValidationError::required("name"));
    }
    if blank(&job.payload_text) {
        return Err(ValidationError::required("payload_text"));
    }
    if blank(&job.timezone) {
        return Err(ValidationError::required("timezone"));
    }
    match job.schedule_kind {
        ScheduleKind::Cron => {
            if job.cron_expr.as_deref().is_none_or(blank) {
                return Err(ValidationError::new(
                    "cron_expr",
                    "is required for cron schedules",
                ));
            }
        }
        ScheduleKind::Interval => match job.interval_ms {
            None => {
                return Err(ValidationError::new(
                    "interval_ms",
                    "is required for interval schedules",
                ));
            }
            Some(ms) if ms <= 0 => {
                return Err(ValidationError::new("interval_ms", "must be positive"));
            }
            Some(_) => {}
        },
        ScheduleKind::Once => {
            if job.run_at.is_none() {
                return Err(ValidationError::new(
                    "run_at",
                    "is required for one-off schedules",
                ));
            }
        }
    }
    if job.max_failures <= 0 {
        return Err(ValidationError::new("max_failures", "must be greater than 0"));
    }
    Ok(())
}

pub fn validate_payload(payload_text: &str) -> Result<(), ValidationError> {
    if blank(payload_text) {
        return Err(ValidationError::required("payload_text"));
    }
    Ok(())
}

pub fn validate_completion(input: &CompleteRunInput) -> Result<(), ValidationError> {
    if blank(&input.job_id) {
        return Err(ValidationError::required("job_id"));
    }
    if blank(&input.run_id) {
        return Err(ValidationError::required("run_id"));
    }
    if !input.status.is_terminal() {
        return Err(ValidationError::new("status", "must be a terminal run status"));
    }
    Ok(())
}
