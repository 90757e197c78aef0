//! The execution pipeline: the public operations a front end calls, wired to
//! the template catalog, job table, queue, audit log and worker pool.
//!
//! Request path (synchronous, every failure audited):
//! lookup → scope check → validate → build → reserve queue slot → audit
//! acceptance → enqueue. A job is only handed to a worker after its
//! acceptance record has been durably appended.

mod worker;

use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditFilter, AuditLog, AuditOutcome, AuditRecord, AuditStage, AuditStore, redact};
use crate::auth::{AuthorizationContext, check_scopes};
use crate::builder::build;
use crate::config::Settings;
use crate::error::GateError;
use crate::job::{CancelRequest, Job, JobCompletion, JobId, JobStatus, JobTable, Retention};
use crate::queue::{JobQueue, QueuedJob};
use crate::sandbox::Sandbox;
use crate::template::{CommandTemplate, TemplateCatalog, TemplateSummary};
use crate::validate::validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    pub retention: Retention,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 100,
            retention: Retention::default(),
        }
    }
}

impl From<&Settings> for PipelineOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            workers: settings.workers,
            queue_capacity: settings.queue_capacity,
            retention: Retention {
                ttl: settings.job_ttl,
                max_finished: settings.max_finished_jobs,
            },
        }
    }
}

/// State shared between the request path and the workers.
struct Shared {
    catalog: Arc<TemplateCatalog>,
    queue: JobQueue,
    jobs: JobTable,
    audit: AuditLog,
    sandbox: Arc<dyn Sandbox>,
}

pub struct Pipeline {
    shared: Arc<Shared>,
    workers: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("workers", &self.workers)
            .field("queue", &self.shared.queue)
            .field("sandbox", &self.shared.sandbox.name())
            .finish()
    }
}

impl Pipeline {
    pub fn new(
        catalog: Arc<TemplateCatalog>,
        audit: Arc<dyn AuditStore>,
        sandbox: Arc<dyn Sandbox>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                catalog,
                queue: JobQueue::new(options.queue_capacity),
                jobs: JobTable::new(options.retention),
                audit: AuditLog::new(audit),
                sandbox,
            }),
            workers: options.workers,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool on the current tokio runtime. Calling it again
    /// while workers are running does nothing.
    pub fn start_workers(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if !handles.is_empty() {
            return;
        }
        for index in 0..self.workers {
            let shared = Arc::clone(&self.shared);
            handles.push(tokio::spawn(worker::run(index, shared)));
        }
        info!(
            workers = self.workers,
            sandbox = self.shared.sandbox.name(),
            "worker pool started"
        );
    }

    pub fn list_templates(&self, category: Option<&str>) -> Vec<TemplateSummary> {
        self.shared.catalog.snapshot().list(category)
    }

    /// Accept one execution request. Returns as soon as the job is queued;
    /// poll [`Pipeline::get_job`] for the result.
    pub async fn submit(
        &self,
        template_name: &str,
        params: Map<String, Value>,
        auth: &AuthorizationContext,
    ) -> Result<JobId, GateError> {
        let registry = self.shared.catalog.snapshot();

        let template = match registry.lookup(template_name) {
            Ok(template) => template,
            Err(e) => {
                let rejection = Rejection::new(AuditStage::Validation, AuditOutcome::Rejected, e);
                return Err(self.reject(rejection, template_name, None, auth, &params).await);
            }
        };

        let grant = match check_scopes(&template, auth) {
            Ok(grant) => grant,
            Err(e) => {
                let rejection = Rejection::new(AuditStage::Authorization, AuditOutcome::Denied, e);
                return Err(self.reject(rejection, template_name, Some(&template), auth, &params).await);
            }
        };

        let resolved = match validate(&template, &params) {
            Ok(resolved) => resolved,
            Err(e) => {
                let rejection = Rejection::new(AuditStage::Validation, AuditOutcome::Rejected, e);
                return Err(self.reject(rejection, template_name, Some(&template), auth, &params).await);
            }
        };

        let command = match build(&template, &resolved, grant) {
            Ok(command) => command,
            Err(e) => {
                let rejection = Rejection::new(AuditStage::Validation, AuditOutcome::Rejected, e);
                return Err(self.reject(rejection, template_name, Some(&template), auth, &params).await);
            }
        };

        let reservation = match self.shared.queue.reserve() {
            Ok(reservation) => reservation,
            Err(e) => {
                let rejection = Rejection::new(AuditStage::Queued, AuditOutcome::Rejected, e);
                return Err(self.reject(rejection, template_name, Some(&template), auth, &params).await);
            }
        };

        let job = Job::new(&template.name, registry.version(), resolved, auth.clone());
        let job_id = job.id;
        self.shared.jobs.insert(job);

        let accepted = AuditRecord::new(
            AuditStage::Queued,
            AuditOutcome::Accepted,
            &template.name,
            &auth.caller,
        )
        .with_job(job_id)
        .with_parameters(redact(Some(&template), &params));

        if let Err(e) = self.shared.audit.append(accepted).await {
            // Never run unaudited: forget the job and give the slot back.
            self.shared.jobs.remove(job_id);
            drop(reservation);
            return Err(e);
        }

        match self.shared.jobs.transition(job_id, JobStatus::Queued) {
            Ok(()) => reservation.push(QueuedJob {
                id: job_id,
                template: Arc::clone(&template),
                command,
            }),
            // Cancelled while the acceptance record was being written.
            Err(GateError::InvalidTransition { from, .. }) => {
                debug!(%job_id, status = %from, "job withdrawn before enqueue");
            }
            Err(e) => return Err(e),
        }

        info!(
            %job_id,
            template = %template.name,
            caller = %auth.caller,
            template_version = registry.version(),
            "job accepted"
        );
        Ok(job_id)
    }

    /// Current state of a job. Pure read; safe to poll.
    pub fn get_job(&self, job_id: JobId) -> Result<Job, GateError> {
        self.shared
            .jobs
            .get(job_id)
            .ok_or(GateError::JobNotFound(job_id))
    }

    /// Cancel a job.
    ///
    /// `Ok(true)`: a pending or queued job is now `cancelled`, or a running
    /// job has been signalled (its terminal state follows from the sandbox).
    /// `Ok(false)`: the job had already finished.
    ///
    /// A waiting job is held while its cancellation is audited. If the audit
    /// write fails the job is released unchanged and the error returned.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, GateError> {
        match self.shared.jobs.request_cancel(job_id)? {
            CancelRequest::Held(job) => {
                let record = AuditRecord::new(
                    AuditStage::Queued,
                    AuditOutcome::Cancelled,
                    &job.template,
                    &job.auth.caller,
                )
                .with_job(job_id)
                .with_detail("cancelled before execution");
                if let Err(e) = self.shared.audit.append(record).await {
                    self.shared.jobs.release(job_id);
                    warn!(%job_id, "cancellation not recorded, job left in place");
                    return Err(e);
                }
                if self.shared.jobs.finish_withdraw(job_id)?.is_some() {
                    info!(%job_id, template = %job.template, caller = %job.auth.caller, "queued job cancelled");
                }
                self.shared.queue.cancel(job_id);
                Ok(true)
            }
            CancelRequest::InProgress => {
                debug!(%job_id, "cancellation already in progress");
                Ok(true)
            }
            CancelRequest::Signalled => {
                info!(%job_id, "cancellation signalled to running job");
                Ok(true)
            }
            CancelRequest::Finished(status) => {
                debug!(%job_id, %status, "cancel ignored, job already finished");
                Ok(false)
            }
        }
    }

    /// Audit records matching `filter`, in append order.
    pub async fn audit_query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, GateError> {
        self.shared.audit.query(filter).await
    }

    /// Load a new template catalog from `path` and swap it in. Jobs already
    /// accepted keep the template version they were accepted with.
    pub fn reload_templates(&self, path: &Path) -> Result<u64, GateError> {
        self.shared.catalog.reload(path)
    }

    pub fn job_count(&self) -> usize {
        self.shared.jobs.len()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Stop accepting work, cancel everything still queued, and wait for the
    /// workers to finish their current jobs.
    pub async fn shutdown(&self) {
        let drained = self.shared.queue.close();
        if !drained.is_empty() {
            warn!(jobs = drained.len(), "cancelling queued jobs at shutdown");
        }

        for queued in drained {
            let job = match self.shared.jobs.complete(queued.id, JobCompletion::cancelled()) {
                Ok(job) => job,
                // Already cancelled through `cancel`.
                Err(_) => continue,
            };
            let record = AuditRecord::new(
                AuditStage::Queued,
                AuditOutcome::Cancelled,
                &job.template,
                &job.auth.caller,
            )
            .with_job(job.id)
            .with_detail("pipeline shut down");
            if let Err(e) = self.shared.audit.append(record).await {
                error!(job_id = %job.id, error = %e, "failed to audit shutdown cancellation");
            }
        }

        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task failed");
            }
        }
        info!("pipeline stopped");
    }

    /// Audit a rejected request and hand back the error for the caller. An
    /// audit failure replaces the original error.
    async fn reject(
        &self,
        rejection: Rejection,
        template_name: &str,
        template: Option<&CommandTemplate>,
        auth: &AuthorizationContext,
        params: &Map<String, Value>,
    ) -> GateError {
        let Rejection {
            stage,
            outcome,
            error,
        } = rejection;
        warn!(
            template = template_name,
            caller = %auth.caller,
            ?stage,
            error = %error,
            "submission rejected"
        );

        let record = AuditRecord::new(stage, outcome, template_name, &auth.caller)
            .with_detail(rejection_detail(&error, template))
            .with_parameters(redact(template, params));
        match self.shared.audit.append(record).await {
            Ok(_) => error,
            Err(audit_error) => audit_error,
        }
    }
}

struct Rejection {
    stage: AuditStage,
    outcome: AuditOutcome,
    error: GateError,
}

impl Rejection {
    fn new(stage: AuditStage, outcome: AuditOutcome, error: GateError) -> Self {
        Self {
            stage,
            outcome,
            error,
        }
    }
}

/// Error text for the audit record, without echoing a sensitive value.
fn rejection_detail(error: &GateError, template: Option<&CommandTemplate>) -> String {
    match (error, template) {
        (GateError::Validation { parameter, .. }, Some(template))
            if template
                .parameters
                .get(parameter)
                .is_some_and(|p| p.sensitive) =>
        {
            format!("invalid parameter '{parameter}'")
        }
        _ => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::template::Registry;

    #[test]
    fn sensitive_validation_detail_hides_reason() {
        let registry = Registry::from_str(
            r#"
[templates.lookup_pin]
command = "pin-lookup {pin}"

[templates.lookup_pin.parameters.pin]
type = "integer"
max_value = 9999
sensitive = true
"#,
        )
        .unwrap();
        let template = registry.lookup("lookup_pin").unwrap();
        let error = GateError::validation("pin", "123456 exceeds the maximum of 9999");
        let detail = rejection_detail(&error, Some(&template));
        assert_eq!(detail, "invalid parameter 'pin'");
        assert!(!detail.contains("123456"));
    }

    #[test]
    fn other_errors_keep_their_message() {
        let error = GateError::TemplateNotFound("rm_rf".into());
        assert_eq!(
            rejection_detail(&error, None),
            "command template 'rm_rf' not found"
        );
    }

    #[test]
    fn options_follow_settings() {
        let settings = Settings {
            workers: 2,
            queue_capacity: 7,
            ..Settings::default()
        };
        assert_eq!(
            PipelineOptions::from(&settings),
            PipelineOptions {
                workers: 2,
                queue_capacity: 7,
                retention: Retention::default(),
            }
        );
    }
}
