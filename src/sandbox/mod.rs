pub mod process;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::builder::CommandLine;
use crate::error::GateError;
use crate::job::JobId;

pub use process::ProcessSandbox;

/// One execution request: the argument vector plus the template's isolation policy.
#[derive(Debug)]
pub struct ExecRequest {
    pub job_id: JobId,
    pub command: CommandLine,
    pub timeout: Duration,
    pub allow_network: bool,
    pub allow_file_write: bool,
    pub writable_paths: Vec<PathBuf>,
}

/// Bytes captured from one output stream, cut at the sandbox's cap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own with this status code.
    Exited(i32),
    /// Killed by a signal it did not get from us (e.g. an rlimit).
    Signaled(i32),
    TimedOut,
    /// Stopped by a cancellation request within the grace period.
    Cancelled,
    /// Ignored the termination signal for the whole grace period and had to be killed.
    Unresponsive,
    /// Required isolation could not be set up; the command never ran.
    IsolationFailed(String),
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub termination: Termination,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
}

/// Extension point for execution backends. Implementations must never pass
/// the command through a shell.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn name(&self) -> &str;

    /// Run to completion, timeout, or cancellation. `Err` means the command
    /// could not be started at all.
    async fn execute(
        &self,
        request: ExecRequest,
        cancel: CancelSignal,
    ) -> Result<ExecOutcome, GateError>;
}

/// Requester side of a cancellation channel.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

/// Sandbox side of a cancellation channel.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        let sender_gone = self.0.wait_for(|cancelled| *cancelled).await.is_err();
        if sender_gone {
            std::future::pending::<()>().await;
        }
    }
}
