use thiserror::Error;

use crate::job::{JobId, JobStatus};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("command template '{0}' not found")]
    TemplateNotFound(String),

    #[error("invalid parameter '{parameter}': {reason}")]
    Validation { parameter: String, reason: String },

    #[error("caller '{caller}' lacks required scopes: {}", missing.join(", "))]
    Authorization { caller: String, missing: Vec<String> },

    #[error("credential not recognized")]
    Unauthenticated,

    #[error("job queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("illegal job transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("template configuration error: {0}")]
    TemplateConfig(String),

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GateError {
    pub(crate) fn validation(parameter: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            parameter: parameter.to_owned(),
            reason: reason.into(),
        }
    }
}
