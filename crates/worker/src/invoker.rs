//! Runs a generation worker to completion and keeps everything it printed.
//!
//! A spawn failure means the job never ran and is an error here. A non-zero
//! exit is not: it comes back as data in [`WorkerInvocation`] and the caller
//! decides what it means.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use lookbook_core::{CapturedOutput, JobError, JobResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long to wait for pipe readers after a timed-out child is killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg<P: AsRef<Path>>(self, path: P) -> Self {
        let text = path.as_ref().to_string_lossy().into_owned();
        self.arg(text)
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

/// A finished worker run.
#[derive(Debug, Clone)]
pub struct WorkerInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub output: CapturedOutput,
    pub duration_ms: u64,
}

impl WorkerInvocation {
    pub fn exit_code(&self) -> Option<i32> {
        self.output.exit_code
    }

    /// Turns a non-zero exit into [`JobError::WorkerExit`], keeping the output.
    pub fn require_success(self) -> JobResult<Self> {
        if self.output.success() {
            Ok(self)
        } else {
            Err(JobError::WorkerExit {
                program: self.program,
                output: self.output,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerInvoker {
    working_dir: PathBuf,
    timeout: Option<Duration>,
    base_env: Vec<(String, String)>,
}

impl WorkerInvoker {
    pub fn new<P: Into<PathBuf>>(working_dir: P) -> Self {
        Self {
            working_dir: working_dir.into(),
            timeout: None,
            base_env: vec![
                ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
                ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
            ],
        }
    }

    /// Upper bound on a single run; `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Spawns the worker and waits for it without blocking the runtime.
    ///
    /// The child is killed if this future is dropped, so an aborted request
    /// does not leave a worker behind.
    pub async fn invoke(&self, command: &WorkerCommand) -> JobResult<WorkerInvocation> {
        let program = command.program_name();
        let started = Instant::now();

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&self.working_dir)
            .envs(self.base_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| JobError::Spawn {
                program: program.clone(),
                source,
            })?;

        info!(
            program = %program,
            args = ?command.args,
            pid = ?child.id(),
            "worker spawned"
        );

        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        let waited = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
            None => Some(child.wait().await),
        };

        let status = match waited {
            Some(Ok(status)) => status,
            Some(Err(source)) => {
                let _ = child.kill().await;
                return Err(JobError::Spawn { program, source });
            }
            None => {
                if let Err(err) = child.kill().await {
                    warn!(program = %program, "failed to kill timed-out worker: {err}");
                }
                let output = CapturedOutput {
                    stdout: drain(stdout, Some(DRAIN_GRACE)).await,
                    stderr: drain(stderr, Some(DRAIN_GRACE)).await,
                    exit_code: None,
                };
                let timeout_secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                warn!(
                    program = %program,
                    timeout_secs,
                    stdout_len = output.stdout.len(),
                    "worker timed out"
                );
                return Err(JobError::WorkerTimeout {
                    program,
                    timeout_secs,
                    output,
                });
            }
        };

        let output = CapturedOutput {
            stdout: drain(stdout, None).await,
            stderr: drain(stderr, None).await,
            exit_code: exit_code(&status),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        info!(
            program = %program,
            exit_code = ?output.exit_code,
            duration_ms,
            stdout_len = output.stdout.len(),
            stderr_len = output.stderr.len(),
            "worker finished"
        );

        Ok(WorkerInvocation {
            program,
            args: command.args.clone(),
            output,
            duration_ms,
        })
    }
}

fn spawn_reader<R>(stream: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            if let Err(err) = stream.read_to_end(&mut buf).await {
                warn!("worker stream read failed after {} bytes: {err}", buf.len());
            }
        }
        buf
    })
}

async fn drain(handle: JoinHandle<Vec<u8>>, grace: Option<Duration>) -> String {
    let bytes = match grace {
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => Vec::new(),
        },
        None => handle.await.unwrap_or_default(),
    };
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(unix)]
fn exit_code(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
}

#[cfg(not(unix))]
fn exit_code(status: &ExitStatus) -> Option<i32> {
    status.code()
}
