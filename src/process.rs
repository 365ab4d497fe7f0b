//! Allow-listed subprocess execution
//!
//! Runs one external command with a working directory, an optional timeout
//! and a cancellation signal. stdout and stderr are drained by their own
//! tasks while the exit is awaited, so large outputs cannot fill a pipe and
//! stall the child. A timeout kills the child (its whole process group on
//! unix) and still returns whatever output was read; cancellation kills it
//! the same way but returns [`Error::Cancelled`].

use crate::cancel::CancelSignal;
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Commands the generator is allowed to launch.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] =
    &["tsp", "npm", "npx", "dotnet", "pwsh", "node", "git"];

/// How long to wait for the pipe readers after the child was killed.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Outcome of one subprocess run. Exactly one of: succeeded, failed with an
/// exit code, or timed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub command: String,
    pub succeeded: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub pid: Option<u32>,
}

impl ProcessResult {
    /// stdout followed by stderr, for error extraction.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl AsRef<Path>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.as_ref().to_path_buf(),
            timeout: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    allowed: HashSet<String>,
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_COMMANDS.iter().copied())
    }
}

impl ProcessRunner {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_allowed(&self, program: &str) -> bool {
        self.allowed.contains(program)
    }

    pub async fn run(&self, spec: &CommandSpec, cancel: &CancelSignal) -> Result<ProcessResult> {
        if spec.program.trim().is_empty() {
            return Err(Error::InvalidInput("command cannot be empty".to_string()));
        }
        if !self.is_allowed(&spec.program) {
            return Err(Error::Unauthorized(format!(
                "Command '{}' is not in the allowed commands list",
                spec.program
            )));
        }
        if !spec.cwd.is_dir() {
            return Err(Error::InvalidInput(format!(
                "Working directory does not exist: {}",
                spec.cwd.display()
            )));
        }
        cancel.check()?;

        let label = spec.label();
        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        debug!(command = %label, cwd = %spec.cwd.display(), "Starting process");
        let start = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| Error::Other(format!("Failed to start {}: {}", label, e)))?;
        let pid = child.id();

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(drain(out, Arc::clone(&stdout_buf))));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(drain(err, Arc::clone(&stderr_buf))));

        let outcome = tokio::select! {
            status = child.wait() => WaitOutcome::Exited(status?),
            _ = sleep_opt(spec.timeout) => WaitOutcome::TimedOut,
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        };

        if !matches!(outcome, WaitOutcome::Exited(_)) {
            kill_tree(&mut child).await;
        }

        join_drain(stdout_task).await;
        join_drain(stderr_task).await;
        let stdout = take_output(&stdout_buf);
        let stderr = take_output(&stderr_buf);
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            WaitOutcome::Exited(status) => {
                let succeeded = status.success();
                if succeeded {
                    info!(command = %label, duration_ms, "Process succeeded");
                } else {
                    warn!(
                        command = %label,
                        exit_code = ?status.code(),
                        duration_ms,
                        "Process failed with exit code {:?}",
                        status.code()
                    );
                }
                Ok(ProcessResult {
                    command: label,
                    succeeded,
                    exit_code: status.code(),
                    stdout,
                    stderr,
                    timed_out: false,
                    duration_ms,
                    pid,
                })
            }
            WaitOutcome::TimedOut => {
                warn!(
                    command = %label,
                    timeout_secs = spec.timeout.map(|t| t.as_secs_f64()),
                    "Process timed out and was terminated"
                );
                Ok(ProcessResult {
                    command: label,
                    succeeded: false,
                    exit_code: None,
                    stdout,
                    stderr,
                    timed_out: true,
                    duration_ms,
                    pid,
                })
            }
            WaitOutcome::Cancelled => {
                info!(command = %label, "Process cancelled");
                Err(Error::Cancelled)
            }
        }
    }
}

async fn sleep_opt(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

async fn drain<R>(mut reader: R, buf: Arc<Mutex<Vec<u8>>>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut out) = buf.lock() {
                    out.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

async fn join_drain(task: Option<JoinHandle<()>>) {
    if let Some(task) = task {
        // A grandchild that escaped the kill can keep the pipe open; stop
        // waiting and keep what was read so far.
        if tokio::time::timeout(DRAIN_GRACE, task).await.is_err() {
            debug!("Output reader still open after grace period");
        }
    }
}

fn take_output(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    let bytes = buf.lock().map(|b| b.clone()).unwrap_or_default();
    String::from_utf8_lossy(&bytes).trim_end().to_string()
}

async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // Negative pid targets the process group created at spawn.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    if let Err(e) = child.start_kill() {
        debug!("start_kill failed: {}", e);
    }
    if let Err(e) = child.wait().await {
        warn!("Failed to reap killed process: {}", e);
    }
}
