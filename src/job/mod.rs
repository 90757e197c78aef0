mod table;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthorizationContext;
use crate::error::GateError;
use crate::validate::ResolvedParams;

pub use table::Retention;
pub(crate) use table::{CancelRequest, JobTable};

pub type JobId = Uuid;

/// Job lifecycle. Variant order follows the lifecycle; terminal states never move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition. No retries: nothing leaves
    /// a terminal state, and nothing goes backwards.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    NonZeroExit,
    ExecutionTimeout,
    SandboxViolation,
    Internal,
}

/// One accepted execution attempt.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub template: String,
    pub template_version: u64,
    pub params: ResolvedParams,
    pub auth: AuthorizationContext,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stdout: String,
    pub stderr: String,
    pub output_truncated: bool,
    pub exit_code: Option<i32>,
    pub error_kind: Option<JobErrorKind>,
    pub error_message: Option<String>,
}

/// Terminal result reported by a worker.
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub output_truncated: bool,
    pub error: Option<(JobErrorKind, String)>,
}

impl JobCompletion {
    pub fn cancelled() -> Self {
        Self {
            status: JobStatus::Cancelled,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            output_truncated: false,
            error: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            error: Some((JobErrorKind::Internal, message.into())),
            ..Self::cancelled()
        }
    }
}

impl Job {
    pub(crate) fn new(
        template: &str,
        template_version: u64,
        params: ResolvedParams,
        auth: AuthorizationContext,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            template: template.to_owned(),
            template_version,
            params,
            auth,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stdout: String::new(),
            stderr: String::new(),
            output_truncated: false,
            exit_code: None,
            error_kind: None,
            error_message: None,
        }
    }

    /// Move to `next`, stamping start/finish times.
    pub(crate) fn transition(&mut self, next: JobStatus) -> Result<(), GateError> {
        if !self.status.can_transition_to(next) {
            return Err(GateError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == JobStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    pub(crate) fn complete(&mut self, completion: JobCompletion) -> Result<(), GateError> {
        if !completion.status.is_terminal() {
            return Err(GateError::Internal(format!(
                "completion with non-terminal status {}",
                completion.status
            )));
        }
        self.transition(completion.status)?;
        self.exit_code = completion.exit_code;
        self.stdout = completion.stdout;
        self.stderr = completion.stderr;
        self.output_truncated = completion.output_truncated;
        if let Some((kind, message)) = completion.error {
            self.error_kind = Some(kind);
            self.error_message = Some(message);
        }
        Ok(())
    }
}
