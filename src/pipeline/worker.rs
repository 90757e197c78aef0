use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use super::Shared;
use crate::audit::{AuditOutcome, AuditRecord, AuditStage};
use crate::job::{JobCompletion, JobErrorKind, JobStatus};
use crate::queue::QueuedJob;
use crate::sandbox::{ExecOutcome, ExecRequest, Termination, cancel_pair};

/// One worker: run queued jobs one at a time until the queue closes.
pub(super) async fn run(worker: usize, shared: Arc<Shared>) {
    debug!(worker, "worker started");
    while let Some(queued) = shared.queue.dequeue().await {
        execute(worker, &shared, queued).await;
    }
    debug!(worker, "worker stopped");
}

async fn execute(worker: usize, shared: &Shared, queued: QueuedJob) {
    let QueuedJob {
        id,
        template,
        command,
    } = queued;

    let (handle, signal) = cancel_pair();
    if let Err(e) = shared.jobs.start(id, handle).await {
        // Cancelled between dequeue and start.
        debug!(worker, job_id = %id, error = %e, "skipping job");
        return;
    }
    debug!(worker, job_id = %id, template = %template.name, "dispatching job");

    let request = ExecRequest {
        job_id: id,
        command,
        timeout: template.timeout,
        allow_network: template.allow_network,
        allow_file_write: template.allow_file_write,
        writable_paths: template.writable_paths(),
    };

    let completion = match shared.sandbox.execute(request, signal).await {
        Ok(outcome) => completion_for(outcome, template.timeout),
        Err(e) => {
            error!(worker, job_id = %id, error = %e, "sandbox failed to run job");
            JobCompletion::internal(e.to_string())
        }
    };

    let job = match shared.jobs.complete(id, completion) {
        Ok(job) => job,
        Err(e) => {
            error!(worker, job_id = %id, error = %e, "failed to record job result");
            return;
        }
    };
    info!(
        worker,
        job_id = %id,
        template = %job.template,
        caller = %job.auth.caller,
        status = %job.status,
        exit_code = ?job.exit_code,
        "job finished"
    );

    let detail = match (&job.error_message, job.exit_code) {
        (Some(message), _) => message.clone(),
        (None, Some(code)) => format!("exit code {code}"),
        (None, None) => job.status.to_string(),
    };
    let record = AuditRecord::new(
        AuditStage::Executed,
        AuditOutcome::for_status(job.status),
        &job.template,
        &job.auth.caller,
    )
    .with_job(id)
    .with_detail(detail);

    if let Err(e) = shared.audit.append(record).await {
        error!(worker, job_id = %id, error = %e, "terminal audit record not written");
    }
}

/// Map how the sandbox ended to the job's terminal result.
pub(super) fn completion_for(outcome: ExecOutcome, timeout: Duration) -> JobCompletion {
    let ExecOutcome {
        termination,
        stdout,
        stderr,
    } = outcome;

    let (status, exit_code, error) = match termination {
        Termination::Exited(0) => (JobStatus::Succeeded, Some(0), None),
        Termination::Exited(code) => (
            JobStatus::Failed,
            Some(code),
            Some((JobErrorKind::NonZeroExit, format!("exited with status {code}"))),
        ),
        Termination::Signaled(signal) => (
            JobStatus::Failed,
            None,
            Some((JobErrorKind::NonZeroExit, format!("killed by signal {signal}"))),
        ),
        Termination::TimedOut => (
            JobStatus::TimedOut,
            None,
            Some((
                JobErrorKind::ExecutionTimeout,
                format!("exceeded the {}s timeout", timeout.as_secs()),
            )),
        ),
        Termination::Cancelled => (JobStatus::Cancelled, None, None),
        Termination::Unresponsive => (
            JobStatus::Failed,
            None,
            Some((
                JobErrorKind::SandboxViolation,
                "process ignored termination".to_owned(),
            )),
        ),
        Termination::IsolationFailed(reason) => (
            JobStatus::Failed,
            None,
            Some((JobErrorKind::SandboxViolation, reason)),
        ),
    };

    JobCompletion {
        status,
        exit_code,
        output_truncated: stdout.truncated || stderr.truncated,
        stdout: stdout.to_string_lossy(),
        stderr: stderr.to_string_lossy(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::CapturedOutput;

    fn outcome(termination: Termination) -> ExecOutcome {
        ExecOutcome {
            termination,
            stdout: CapturedOutput {
                bytes: b"out".to_vec(),
                truncated: false,
            },
            stderr: CapturedOutput::default(),
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[test]
    fn zero_exit_succeeds() {
        let c = completion_for(outcome(Termination::Exited(0)), TIMEOUT);
        assert_eq!(c.status, JobStatus::Succeeded);
        assert_eq!(c.exit_code, Some(0));
        assert_eq!(c.stdout, "out");
        assert!(c.error.is_none());
    }

    #[test]
    fn nonzero_exit_fails() {
        let c = completion_for(outcome(Termination::Exited(2)), TIMEOUT);
        assert_eq!(c.status, JobStatus::Failed);
        assert_eq!(c.exit_code, Some(2));
        assert!(matches!(c.error, Some((JobErrorKind::NonZeroExit, _))));
    }

    #[test]
    fn timeout_reported_as_timed_out() {
        let c = completion_for(outcome(Termination::TimedOut), TIMEOUT);
        assert_eq!(c.status, JobStatus::TimedOut);
        let (kind, message) = c.error.unwrap();
        assert_eq!(kind, JobErrorKind::ExecutionTimeout);
        assert!(message.contains("30s"));
    }

    #[test]
    fn unresponsive_process_is_a_sandbox_violation() {
        let c = completion_for(outcome(Termination::Unresponsive), TIMEOUT);
        assert_eq!(c.status, JobStatus::Failed);
        assert!(matches!(c.error, Some((JobErrorKind::SandboxViolation, _))));
    }

    #[test]
    fn isolation_failure_is_a_sandbox_violation() {
        let c = completion_for(
            outcome(Termination::IsolationFailed("no netns".into())),
            TIMEOUT,
        );
        assert_eq!(c.status, JobStatus::Failed);
        assert_eq!(
            c.error,
            Some((JobErrorKind::SandboxViolation, "no netns".to_owned()))
        );
    }

    #[test]
    fn cancelled_keeps_partial_output() {
        let mut out = outcome(Termination::Cancelled);
        out.stderr = CapturedOutput {
            bytes: b"partial".to_vec(),
            truncated: true,
        };
        let c = completion_for(out, TIMEOUT);
        assert_eq!(c.status, JobStatus::Cancelled);
        assert_eq!(c.stderr, "partial");
        assert!(c.output_truncated);
    }
}
