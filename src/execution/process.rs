//! Shell process execution with streamed output.
//!
//! [`ProcessExecutor::start`] spawns a command through the configured shell
//! and returns a [`RunningProcess`]. Output from stdout and stderr arrives as
//! [`OutputChunk`]s in the order it was read, the process can be terminated
//! at any time through a [`ProcessKiller`], and [`RunningProcess::wait`]
//! yields the exit classification.
//!
//! On Unix the child runs in its own process group; terminating it sends
//! `SIGTERM` to the whole group and escalates to `SIGKILL` once the grace
//! period expires. The group stays reachable after the shell itself exits,
//! for as long as something it started still holds the output pipes.
//! Elsewhere the process tree is killed outright.

use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::decode::OutputDecoder;
use crate::events::OutputStream;

/// Default time a terminated process gets before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

const READ_BUFFER_SIZE: usize = 4096;
const OUTPUT_CHANNEL_BUFFER: usize = 64;

/// Errors from starting or supervising a process.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The shell could not be spawned.
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting for the process failed.
    #[error("failed to wait for process: {0}")]
    Wait(String),
}

/// The shell used to interpret command text.
///
/// The command text is appended as the final argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shell {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Shell {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `powershell -NoProfile -NonInteractive -Command` on Windows,
    /// `sh -c` everywhere else.
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Self::new("powershell", ["-NoProfile", "-NonInteractive", "-Command"])
        } else {
            Self::new("sh", ["-c"])
        }
    }
}

impl Default for Shell {
    fn default() -> Self {
        Self::platform_default()
    }
}

/// A piece of decoded output from one of the child's pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exit status zero.
    Success,
    /// Non-zero exit code or killed by a signal.
    Failure {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl ExitOutcome {
    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            return ExitOutcome::Success;
        }

        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        ExitOutcome::Failure {
            code: status.code(),
            signal,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitOutcome::Success)
    }

    /// Human-readable summary, e.g. `exit code 2`.
    pub fn describe(&self) -> String {
        match self {
            ExitOutcome::Success => "exit code 0".to_string(),
            ExitOutcome::Failure {
                code: Some(code), ..
            } => format!("exit code {}", code),
            ExitOutcome::Failure {
                signal: Some(signal),
                ..
            } => format!("terminated by signal {}", signal),
            ExitOutcome::Failure { .. } => "process failed".to_string(),
        }
    }
}

/// Spawns commands through a shell.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    shell: Shell,
    stop_grace: Duration,
    working_dir: Option<PathBuf>,
    fallback_encoding: Option<&'static Encoding>,
}

impl ProcessExecutor {
    pub fn new(shell: Shell) -> Self {
        Self {
            shell,
            stop_grace: DEFAULT_STOP_GRACE,
            working_dir: None,
            fallback_encoding: None,
        }
    }

    /// Set how long a terminated process may take before it is killed.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Run commands from the given directory instead of the current one.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Decode output that is not valid UTF-8 with this encoding instead.
    pub fn with_fallback_encoding(mut self, encoding: Option<&'static Encoding>) -> Self {
        self.fallback_encoding = encoding;
        self
    }

    pub fn shell(&self) -> &Shell {
        &self.shell
    }

    pub fn stop_grace(&self) -> Duration {
        self.stop_grace
    }

    /// Spawn `command_text` through the shell.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, command_text: &str) -> Result<RunningProcess, ExecError> {
        let mut cmd = Command::new(&self.shell.program);
        cmd.args(&self.shell.args)
            .arg(command_text)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: self.shell.program.clone(),
            source,
        })?;
        let pid = child.id();
        tracing::debug!(pid = ?pid, command = %command_text, "process spawned");

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_BUFFER);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(
                stdout,
                OutputStream::Stdout,
                OutputDecoder::new(self.fallback_encoding),
                output_tx.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(
                stderr,
                OutputStream::Stderr,
                OutputDecoder::new(self.fallback_encoding),
                output_tx,
            ));
        }

        let stop = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(supervise(child, stop.clone(), readers, self.stop_grace, exit_tx));

        Ok(RunningProcess {
            pid,
            output: output_rx,
            killer: ProcessKiller { stop },
            exit: exit_rx,
        })
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(Shell::default())
    }
}

/// Wait for the child, stopping it early if asked to, then keep watching
/// the pipes until every process holding them is gone.
async fn supervise(
    mut child: Child,
    stop: CancellationToken,
    readers: Vec<JoinHandle<()>>,
    grace: Duration,
    exit_tx: oneshot::Sender<Result<ExitOutcome, ExecError>>,
) {
    let pid = child.id();
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop.cancelled() => stop_child(&mut child, grace).await,
    };
    let outcome = status
        .map(ExitOutcome::from_status)
        .map_err(|e| ExecError::Wait(e.to_string()));
    tracing::debug!(pid = ?pid, outcome = ?outcome, "process exited");
    let _ = exit_tx.send(outcome);

    let pipes_closed = async {
        for reader in readers {
            let _ = reader.await;
        }
    };
    tokio::pin!(pipes_closed);

    tokio::select! {
        biased;
        _ = &mut pipes_closed => {}
        _ = stop.cancelled() => {
            if let Some(pid) = pid {
                stop_stragglers(pid, grace, &mut pipes_closed).await;
            }
        }
    }
}

/// Stop what is left of the group once the shell has exited.
///
/// A group member holding the pipes keeps the group id from being reused.
#[cfg(unix)]
async fn stop_stragglers<F>(pgid: u32, grace: Duration, pipes_closed: F)
where
    F: std::future::Future<Output = ()> + Unpin,
{
    signal_group(pgid, libc::SIGTERM);
    if tokio::time::timeout(grace, pipes_closed).await.is_err() {
        tracing::debug!(pgid, "output pipes still open after grace period, killing group");
        signal_group(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
async fn stop_stragglers<F>(pid: u32, _grace: Duration, _pipes_closed: F)
where
    F: std::future::Future<Output = ()> + Unpin,
{
    tracing::debug!(pid, "shell already exited, output pipes left to close on their own");
}

#[cfg(unix)]
async fn stop_child(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        signal_group(pid, libc::SIGTERM);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => return status,
            Err(_) => {
                tracing::debug!(pid, "process still alive after grace period, killing");
                signal_group(pid, libc::SIGKILL);
            }
        }
    }
    let _ = child.start_kill();
    child.wait().await
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    // SAFETY: kill(2) takes plain integers; a negative pid addresses the
    // process group created for the child at spawn time.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        tracing::debug!(pid, signal, error = %err, "failed to signal process group");
    }
}

#[cfg(windows)]
async fn stop_child(child: &mut Child, _grace: Duration) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        let result = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            tracing::debug!(pid, error = %e, "taskkill failed");
        }
    }
    let _ = child.start_kill();
    child.wait().await
}

#[cfg(not(any(unix, windows)))]
async fn stop_child(child: &mut Child, _grace: Duration) -> std::io::Result<ExitStatus> {
    let _ = child.start_kill();
    child.wait().await
}

fn spawn_reader<R>(
    mut reader: R,
    stream: OutputStream,
    mut decoder: OutputDecoder,
    tx: mpsc::Sender<OutputChunk>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let text = decoder.push(&buf[..n]);
                    if text.is_empty() {
                        continue;
                    }
                    if tx.send(OutputChunk { stream, text }).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(stream = %stream, error = %e, "failed to read process output");
                    break;
                }
            }
        }

        let rest = decoder.finish();
        tracing::trace!(stream = %stream, encoding = decoder.encoding().name(), "output stream closed");
        if !rest.is_empty() {
            let _ = tx.send(OutputChunk { stream, text: rest }).await;
        }
    })
}

/// Cloneable handle that asks a process to stop.
#[derive(Debug, Clone)]
pub struct ProcessKiller {
    stop: CancellationToken,
}

impl ProcessKiller {
    /// Request termination. Returns immediately and repeated calls do
    /// nothing. Processes the shell left behind are still reached while
    /// they hold the output pipes.
    pub fn terminate(&self) {
        self.stop.cancel();
    }
}

/// A spawned child process.
#[derive(Debug)]
pub struct RunningProcess {
    pid: Option<u32>,
    output: mpsc::Receiver<OutputChunk>,
    killer: ProcessKiller,
    exit: oneshot::Receiver<Result<ExitOutcome, ExecError>>,
}

impl RunningProcess {
    /// OS process id, if the process had not already been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next chunk of output; `None` once both pipes are closed.
    pub async fn next_chunk(&mut self) -> Option<OutputChunk> {
        self.output.recv().await
    }

    pub fn killer(&self) -> ProcessKiller {
        self.killer.clone()
    }

    /// See [`ProcessKiller::terminate`].
    pub fn terminate(&self) {
        self.killer.terminate();
    }

    /// Wait for the process to exit.
    pub async fn wait(self) -> Result<ExitOutcome, ExecError> {
        self.exit
            .await
            .map_err(|_| ExecError::Wait("process supervisor went away".to_string()))?
    }
}
