//! Append-only audit trail. Every submission attempt leaves a record, whatever
//! stage it reached. A store failure is never swallowed: callers get
//! [`GateError::Internal`] and must not proceed.

pub mod file;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::error;

use crate::error::GateError;
use crate::job::{JobId, JobStatus};
use crate::template::CommandTemplate;

pub use file::NdjsonAuditStore;
pub use memory::MemoryAuditStore;

const REDACTED: &str = "[redacted]";
const MAX_SNAPSHOT_CHARS: usize = 256;

/// Furthest pipeline stage a request reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    Validation,
    Authorization,
    Queued,
    Executed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Accepted,
    Rejected,
    Denied,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl AuditOutcome {
    /// Outcome recorded for a job that ended in `status`.
    pub fn for_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Succeeded => Self::Succeeded,
            JobStatus::TimedOut => Self::TimedOut,
            JobStatus::Cancelled => Self::Cancelled,
            JobStatus::Pending | JobStatus::Queued | JobStatus::Running | JobStatus::Failed => {
                Self::Failed
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Position in the log, assigned by the store on append (starts at 1).
    #[serde(default)]
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub template: String,
    pub caller: String,
    pub stage: AuditStage,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl AuditRecord {
    pub fn new(
        stage: AuditStage,
        outcome: AuditOutcome,
        template: impl Into<String>,
        caller: impl Into<String>,
    ) -> Self {
        Self {
            seq: 0,
            recorded_at: Utc::now(),
            job_id: None,
            template: template.into(),
            caller: caller.into(),
            stage,
            outcome,
            detail: None,
            parameters: Map::new(),
        }
    }

    pub fn with_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Query filters. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditFilter {
    pub job_id: Option<JobId>,
    pub caller: Option<String>,
    pub template: Option<String>,
    pub outcome: Option<AuditOutcome>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.job_id.is_none_or(|id| record.job_id == Some(id))
            && self.caller.as_ref().is_none_or(|c| &record.caller == c)
            && self.template.as_ref().is_none_or(|t| &record.template == t)
            && self.outcome.is_none_or(|o| record.outcome == o)
            && self.since.is_none_or(|t| record.recorded_at >= t)
            && self.until.is_none_or(|t| record.recorded_at <= t)
    }

    /// Filter `records` (in append order), honouring `limit`.
    pub fn apply<'a>(&self, records: impl IntoIterator<Item = &'a AuditRecord>) -> Vec<AuditRecord> {
        records
            .into_iter()
            .filter(|r| self.matches(r))
            .take(self.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

/// Backing store for audit records. Implementations must serialize
/// concurrent appends and never rewrite or delete a record.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Durably append `record`, returning it with its assigned sequence number.
    async fn append(&self, record: AuditRecord) -> Result<AuditRecord, GateError>;

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, GateError>;
}

/// Front for an [`AuditStore`] that turns any store failure into
/// [`GateError::Internal`] and logs it.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub async fn append(&self, record: AuditRecord) -> Result<AuditRecord, GateError> {
        let (template, outcome) = (record.template.clone(), record.outcome);
        self.store.append(record).await.map_err(|e| {
            error!(template = %template, ?outcome, error = %e, "audit append failed");
            match e {
                GateError::Internal(_) => e,
                other => GateError::Internal(format!("audit store: {other}")),
            }
        })
    }

    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, GateError> {
        self.store.query(filter).await.map_err(|e| match e {
            GateError::Internal(_) => e,
            other => GateError::Internal(format!("audit store: {other}")),
        })
    }
}

/// Snapshot of submitted parameters safe to persist: sensitive and unknown
/// values are masked, long strings are clipped, nested values are elided.
pub fn redact(template: Option<&CommandTemplate>, submitted: &Map<String, Value>) -> Map<String, Value> {
    submitted
        .iter()
        .map(|(name, value)| {
            let spec = template.and_then(|t| t.parameters.get(name));
            let masked = match (template, spec) {
                (_, Some(spec)) if spec.sensitive => Value::String(REDACTED.to_owned()),
                // Names outside the schema are kept as evidence, values are not.
                (Some(_), None) => Value::String(REDACTED.to_owned()),
                _ => clip(value),
            };
            (name.clone(), masked)
        })
        .collect()
}

fn clip(value: &Value) -> Value {
    match value {
        Value::String(s) if s.chars().count() > MAX_SNAPSHOT_CHARS => {
            let mut clipped: String = s.chars().take(MAX_SNAPSHOT_CHARS).collect();
            clipped.push_str("...");
            Value::String(clipped)
        }
        Value::Array(_) | Value::Object(_) => Value::String("[structured value]".to_owned()),
        other => other.clone(),
    }
}
