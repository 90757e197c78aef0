//! Built-in sandbox: a direct child process (never a shell) in its own process
//! group, with a cleared environment and rlimits. On Linux the child also gets
//! its own user and mount namespaces with the whole tree remounted read-only,
//! plus a private network namespace unless the template allows network access.

#[cfg(unix)]
use std::ffi::CString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{CancelSignal, CapturedOutput, ExecOutcome, ExecRequest, Sandbox, Termination};
use crate::config::{ResourceLimits, Settings};
use crate::error::GateError;

const READ_CHUNK: usize = 8 * 1024;
/// How long to wait for the output pipes to close once the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// errno the child reports when required isolation cannot be established.
#[cfg(unix)]
const ISOLATION_ERRNO: i32 = nix::errno::Errno::ENOTSUP as i32;

#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    limits: ResourceLimits,
    max_output_bytes: usize,
    cancel_grace: Duration,
    strict_isolation: bool,
    path_env: String,
    workdir: PathBuf,
}

enum Wake {
    Exited(io::Result<ExitStatus>),
    Deadline,
    Cancel,
}

#[derive(Clone, Copy)]
enum StopSignal {
    Terminate,
    Kill,
}

impl ProcessSandbox {
    pub fn new(settings: &Settings) -> Self {
        if !settings.strict_isolation {
            warn!("strict isolation disabled: jobs run even where network isolation fails");
        }
        Self {
            limits: settings.limits,
            max_output_bytes: settings.max_output_bytes,
            cancel_grace: settings.cancel_grace,
            strict_isolation: settings.strict_isolation,
            path_env: settings.sandbox_path.clone(),
            workdir: settings.workdir.clone(),
        }
    }

    fn working_dir(&self, request: &ExecRequest) -> PathBuf {
        if request.allow_file_write
            && let Some(dir) = request.writable_paths.iter().find(|p| p.is_dir())
        {
            return dir.clone();
        }
        self.workdir.clone()
    }

    /// SIGTERM, wait out the grace period, then SIGKILL.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) -> Termination {
        signal_group(child, pid, StopSignal::Terminate);
        match tokio::time::timeout(self.cancel_grace, child.wait()).await {
            Ok(_) => Termination::Cancelled,
            Err(_) => {
                warn!(
                    ?pid,
                    grace_ms = self.cancel_grace.as_millis() as u64,
                    "process ignored termination, killing"
                );
                signal_group(child, pid, StopSignal::Kill);
                let _ = child.wait().await;
                Termination::Unresponsive
            }
        }
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn name(&self) -> &str {
        "process"
    }

    async fn execute(
        &self,
        request: ExecRequest,
        mut cancel: CancelSignal,
    ) -> Result<ExecOutcome, GateError> {
        let program = request.command.program().to_owned();
        let mut cmd = Command::new(&program);
        cmd.args(request.command.args())
            .env_clear()
            .env("PATH", &self.path_env)
            .env("LANG", "C")
            .current_dir(self.working_dir(&request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
            let setup = ChildSetup::new(self, &request)?;
            // SAFETY: runs between fork and exec. Every path was converted to a
            // C string up front, so the closure only issues syscalls and does
            // not allocate or take locks.
            unsafe {
                cmd.pre_exec(move || setup.apply());
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if is_isolation_failure(&e) => {
                return Ok(ExecOutcome {
                    termination: Termination::IsolationFailed(
                        "sandbox isolation could not be established".to_owned(),
                    ),
                    stdout: CapturedOutput::default(),
                    stderr: CapturedOutput::default(),
                });
            }
            Err(e) => {
                return Err(GateError::Internal(format!("failed to spawn '{program}': {e}")));
            }
        };

        let pid = child.id();
        debug!(job_id = %request.job_id, ?pid, program = %program, "process started");

        let cap = self.max_output_bytes;
        let stdout = child.stdout.take().map(|s| tokio::spawn(read_capped(s, cap)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(read_capped(s, cap)));

        let wake = tokio::select! {
            status = child.wait() => Wake::Exited(status),
            () = tokio::time::sleep(request.timeout) => Wake::Deadline,
            () = cancel.cancelled() => Wake::Cancel,
        };

        let termination = match wake {
            Wake::Exited(Ok(status)) => classify(status),
            Wake::Exited(Err(e)) => {
                signal_group(&mut child, pid, StopSignal::Kill);
                return Err(GateError::Internal(format!("failed waiting on '{program}': {e}")));
            }
            Wake::Deadline => {
                signal_group(&mut child, pid, StopSignal::Kill);
                let _ = child.wait().await;
                Termination::TimedOut
            }
            Wake::Cancel => self.terminate(&mut child, pid).await,
        };

        // Anything still in the group (background children) holds the pipes open.
        signal_group(&mut child, pid, StopSignal::Kill);

        Ok(ExecOutcome {
            termination,
            stdout: collect(stdout).await,
            stderr: collect(stderr).await,
        })
    }
}

/// Read a stream to EOF, keeping the first `cap` bytes. The rest is drained
/// and discarded so the writer never stalls on a full pipe.
async fn read_capped<R>(mut reader: R, cap: usize) -> CapturedOutput
where
    R: AsyncRead + Unpin,
{
    let mut out = CapturedOutput::default();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(out.bytes.len());
                if n > room {
                    out.truncated = true;
                }
                out.bytes.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    out
}

async fn collect(task: Option<JoinHandle<CapturedOutput>>) -> CapturedOutput {
    let Some(mut task) = task else {
        return CapturedOutput::default();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(error = %e, "output reader failed");
            CapturedOutput {
                bytes: Vec::new(),
                truncated: true,
            }
        }
        Err(_) => {
            task.abort();
            warn!("output pipe still open after process exit, abandoning capture");
            CapturedOutput {
                bytes: Vec::new(),
                truncated: true,
            }
        }
    }
}

fn classify(status: ExitStatus) -> Termination {
    if let Some(code) = status.code() {
        return Termination::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Termination::Signaled(signal);
        }
    }
    Termination::Exited(-1)
}

#[cfg(unix)]
fn signal_group(_child: &mut Child, pid: Option<u32>, signal: StopSignal) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let signal = match signal {
        StopSignal::Terminate => Signal::SIGTERM,
        StopSignal::Kill => Signal::SIGKILL,
    };
    // ESRCH once the whole group is gone.
    let _ = killpg(Pid::from_raw(pgid), signal);
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pid: Option<u32>, _signal: StopSignal) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn is_isolation_failure(e: &io::Error) -> bool {
    e.raw_os_error() == Some(ISOLATION_ERRNO)
}

#[cfg(not(unix))]
fn is_isolation_failure(_e: &io::Error) -> bool {
    false
}

#[cfg(unix)]
fn c_path(path: &std::path::Path) -> Result<CString, GateError> {
    use std::os::unix::ffi::OsStrExt;

    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| GateError::Internal(format!("path contains a NUL byte: {}", path.display())))
}

/// Restrictions the child applies to itself before exec.
#[cfg(unix)]
struct ChildSetup {
    limits: ResourceLimits,
    allow_file_write: bool,
    isolate_network: bool,
    strict: bool,
    /// Paths bound back read-write after the tree is made read-only.
    writable: Vec<CString>,
    workdir: CString,
}

#[cfg(unix)]
impl ChildSetup {
    fn new(sandbox: &ProcessSandbox, request: &ExecRequest) -> Result<Self, GateError> {
        let writable = if request.allow_file_write {
            request
                .writable_paths
                .iter()
                .filter(|p| p.is_absolute())
                .map(|p| c_path(p))
                .collect::<Result<_, _>>()?
        } else {
            Vec::new()
        };
        Ok(Self {
            limits: sandbox.limits,
            allow_file_write: request.allow_file_write,
            isolate_network: !request.allow_network,
            strict: sandbox.strict_isolation,
            writable,
            workdir: c_path(&sandbox.working_dir(request))?,
        })
    }

    fn apply(&self) -> io::Result<()> {
        use nix::sys::resource::{Resource, setrlimit};

        let cpu = self.limits.cpu_seconds;
        setrlimit(Resource::RLIMIT_CPU, cpu, cpu)?;
        let memory = self.limits.memory_bytes;
        setrlimit(Resource::RLIMIT_AS, memory, memory)?;
        let files = self.limits.open_files;
        setrlimit(Resource::RLIMIT_NOFILE, files, files)?;
        // Zero blocks every regular-file write; pipes are unaffected.
        let fsize = if self.allow_file_write {
            self.limits.max_file_bytes
        } else {
            0
        };
        setrlimit(Resource::RLIMIT_FSIZE, fsize, fsize)?;

        self.isolate()
    }

    #[cfg(target_os = "linux")]
    fn isolate(&self) -> io::Result<()> {
        use nix::sched::{CloneFlags, unshare};

        let mut flags = CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS;
        if self.isolate_network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if unshare(flags).is_err() {
            return self.isolation_failed();
        }
        if mounts::set_read_only(c"/", true).is_err() {
            return self.isolation_failed();
        }
        for path in &self.writable {
            // Missing paths and read-only filesystems stay unwritable.
            let _ = mounts::bind_writable(path);
        }
        // The inherited cwd still points at the mount underneath any new bind.
        nix::unistd::chdir(self.workdir.as_c_str())?;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn isolate(&self) -> io::Result<()> {
        self.isolation_failed()
    }

    fn isolation_failed(&self) -> io::Result<()> {
        if self.strict {
            Err(io::Error::from_raw_os_error(ISOLATION_ERRNO))
        } else {
            Ok(())
        }
    }
}

/// Mount-attribute changes for the child's private mount namespace. The
/// child owns the namespace through its new user namespace, so nothing here
/// needs privileges on the host.
#[cfg(target_os = "linux")]
mod mounts {
    use std::ffi::CStr;
    use std::io;

    use nix::mount::{MsFlags, mount};

    const MOUNT_ATTR_RDONLY: u64 = 0x0000_0001;
    const AT_RECURSIVE: libc::c_uint = 0x8000;

    /// `struct mount_attr` from `<linux/mount.h>`.
    #[repr(C)]
    struct MountAttr {
        attr_set: u64,
        attr_clr: u64,
        propagation: u64,
        userns_fd: u64,
    }

    /// Flip the read-only flag on `path` and every mount below it. Also makes
    /// the subtree private so nothing propagates back to the host.
    pub(super) fn set_read_only(path: &CStr, read_only: bool) -> io::Result<()> {
        let mut attr = MountAttr {
            attr_set: if read_only { MOUNT_ATTR_RDONLY } else { 0 },
            attr_clr: if read_only { 0 } else { MOUNT_ATTR_RDONLY },
            propagation: libc::MS_PRIVATE as u64,
            userns_fd: 0,
        };
        // SAFETY: `path` is NUL-terminated and `attr` outlives the call; the
        // size argument matches the struct the kernel reads.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_mount_setattr,
                libc::AT_FDCWD,
                path.as_ptr(),
                AT_RECURSIVE,
                &mut attr as *mut MountAttr,
                std::mem::size_of::<MountAttr>(),
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Bind `path` over itself and clear read-only on the new mount.
    pub(super) fn bind_writable(path: &CStr) -> io::Result<()> {
        mount(
            Some(path),
            path,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )?;
        set_read_only(path, false)
    }
}
