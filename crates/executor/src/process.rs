use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;

use convoy_core::{CoreError, CoreResult, ManagerId, TaskId};

use crate::command::CommandSpec;
use crate::redact::redact;
use crate::{output_store, task_scope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationMode {
    /// Ask the process group to stop (SIGTERM).
    Graceful,
    /// Force it down (SIGKILL).
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    Code(i32),
    Signalled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit: ExitDisposition,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[async_trait]
pub trait RunningProcess: Send {
    fn pid(&self) -> Option<u32>;

    fn terminate(&self, mode: TerminationMode) -> CoreResult<()>;

    async fn wait(self: Box<Self>) -> CoreResult<ProcessOutput>;
}

#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    async fn spawn(
        &self,
        manager: ManagerId,
        spec: &CommandSpec,
        timeout: Option<Duration>,
    ) -> CoreResult<Box<dyn RunningProcess>>;
}

/// Maps a task id to the pid of the external process it is currently waiting
/// on, so a cancel request can signal the right process group.
static RUNNING_PIDS: OnceLock<Mutex<HashMap<u64, u32>>> = OnceLock::new();

fn running_pids() -> &'static Mutex<HashMap<u64, u32>> {
    RUNNING_PIDS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn register_pid(task: TaskId, pid: u32) {
    if let Ok(mut map) = running_pids().lock() {
        map.insert(task.0, pid);
    }
}

fn unregister_pid(task: TaskId) {
    if let Ok(mut map) = running_pids().lock() {
        map.remove(&task.0);
    }
}

/// Signals the process group currently attributed to `task`. Returns whether a
/// live process was found. The caller still has to wait for actual exit; this
/// only delivers the signal.
pub fn terminate_task_process(task: TaskId, mode: TerminationMode) -> bool {
    let pid = running_pids().lock().ok().and_then(|map| map.get(&task.0).copied());
    match pid {
        Some(pid) => {
            signal_process_group(pid, mode);
            true
        }
        None => false,
    }
}

#[cfg(unix)]
fn signal_process_group(pid: u32, mode: TerminationMode) {
    let signal = match mode {
        TerminationMode::Graceful => libc::SIGTERM,
        TerminationMode::Kill => libc::SIGKILL,
    };
    let pgid = -(pid as libc::pid_t);
    let result = unsafe { libc::kill(pgid, signal) };
    if result != 0 {
        let error = std::io::Error::last_os_error();
        if error.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pid, signal, %error, "failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
fn signal_process_group(_pid: u32, _mode: TerminationMode) {}

/// Real executor: spawns the command in its own process group with piped
/// stdio, so termination signals reach descendants as well.
pub struct SystemProcessExecutor;

#[async_trait]
impl ProcessExecutor for SystemProcessExecutor {
    async fn spawn(
        &self,
        manager: ManagerId,
        spec: &CommandSpec,
        timeout: Option<Duration>,
    ) -> CoreResult<Box<dyn RunningProcess>> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|error| {
            CoreError::ExecutionFailed(format!(
                "{manager}: failed to spawn '{}': {error}",
                spec.program.display()
            ))
        })?;

        Ok(Box::new(SystemRunningProcess {
            pid: child.id(),
            child: Some(child),
            timeout,
            started_at: Utc::now(),
        }))
    }
}

struct SystemRunningProcess {
    child: Option<tokio::process::Child>,
    pid: Option<u32>,
    timeout: Option<Duration>,
    started_at: DateTime<Utc>,
}

#[async_trait]
impl RunningProcess for SystemRunningProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&self, mode: TerminationMode) -> CoreResult<()> {
        if let Some(pid) = self.pid {
            signal_process_group(pid, mode);
        }
        Ok(())
    }

    async fn wait(mut self: Box<Self>) -> CoreResult<ProcessOutput> {
        let mut child = self
            .child
            .take()
            .ok_or_else(|| CoreError::Internal("child process already consumed".to_string()))?;

        let stdout_task = drain_stream(child.stdout.take());
        let stderr_task = drain_stream(child.stderr.take());

        // Wait for exit first; descendant processes may keep the pipes open,
        // so stream collection gets a short bounded window afterwards.
        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    if let Some(pid) = self.pid {
                        signal_process_group(pid, TerminationMode::Kill);
                    }
                    let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
                    stdout_task.abort();
                    stderr_task.abort();
                    return Err(CoreError::ExecutionFailed(format!(
                        "process timed out after {}ms",
                        limit.as_millis()
                    )));
                }
            },
            None => child.wait().await,
        }
        .map_err(|error| CoreError::ExecutionFailed(format!("failed to wait for process: {error}")))?;

        let read_deadline = Duration::from_millis(250);
        let stdout = match tokio::time::timeout(read_deadline, stdout_task).await {
            Ok(Ok(buffer)) => buffer,
            _ => Vec::new(),
        };
        let stderr = match tokio::time::timeout(read_deadline, stderr_task).await {
            Ok(Ok(buffer)) => buffer,
            _ => Vec::new(),
        };

        let exit = match status.code() {
            Some(code) => ExitDisposition::Code(code),
            None => ExitDisposition::Signalled,
        };

        Ok(ProcessOutput {
            exit,
            stdout,
            stderr,
            started_at: self.started_at,
            finished_at: Utc::now(),
        })
    }
}

fn drain_stream<R>(stream: Option<R>) -> tokio::task::JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(mut handle) = stream {
            let mut chunk = vec![0_u8; 4096];
            loop {
                match handle.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(count) => buffer.extend_from_slice(&chunk[..count]),
                }
            }
        }
        buffer
    })
}

/// Result of one harness run with decoded streams, ready for parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub command: String,
    pub exit: ExitDisposition,
    pub stdout: String,
    pub stderr: String,
}

/// Shared execution path for every adapter: validates the argument list,
/// attributes command and output to the ambient task, and registers the pid
/// for cancellation while the process runs.
#[derive(Clone)]
pub struct ExecHarness {
    executor: Arc<dyn ProcessExecutor>,
}

impl ExecHarness {
    pub fn new(executor: Arc<dyn ProcessExecutor>) -> Self {
        Self { executor }
    }

    pub async fn run(
        &self,
        manager: ManagerId,
        spec: CommandSpec,
        timeout: Option<Duration>,
    ) -> CoreResult<Captured> {
        spec.validate()?;
        let rendered = spec.display();
        let task = task_scope::current();
        if let Some(task) = task {
            output_store::record_command(task, &rendered);
        }

        tracing::debug!(%manager, command = %rendered, "spawning external process");
        let process = self.executor.spawn(manager, &spec, timeout).await?;

        if let (Some(task), Some(pid)) = (task, process.pid()) {
            register_pid(task, pid);
        }
        let waited = process.wait().await;
        if let Some(task) = task {
            unregister_pid(task);
        }

        let output = waited?;
        if let Some(task) = task {
            output_store::record_streams(task, &output.stdout, &output.stderr);
        }

        Ok(Captured {
            command: rendered,
            exit: output.exit,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Runs and maps anything other than exit code zero to `ExecutionFailed`
    /// with a redacted stderr excerpt.
    pub async fn run_expect_success(
        &self,
        manager: ManagerId,
        spec: CommandSpec,
        timeout: Option<Duration>,
    ) -> CoreResult<String> {
        let captured = self.run(manager, spec, timeout).await?;
        match captured.exit {
            ExitDisposition::Code(0) => Ok(captured.stdout),
            ExitDisposition::Code(code) => Err(CoreError::ExecutionFailed(format!(
                "{manager}: exited with code {code}: {}",
                redact(excerpt(&captured.stderr))
            ))),
            ExitDisposition::Signalled => Err(CoreError::ExecutionFailed(format!(
                "{manager}: terminated by signal"
            ))),
        }
    }
}

fn excerpt(text: &str) -> &str {
    const LIMIT: usize = 512;
    let trimmed = text.trim();
    match trimmed.char_indices().nth(LIMIT) {
        Some((offset, _)) => &trimmed[..offset],
        None => trimmed,
    }
}
