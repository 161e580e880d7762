// ABOUTME: Host subprocess execution with timeout escalation and line-based streaming
// ABOUTME: Every runtime CLI invocation flows through the CommandRunner seam defined here

use crate::config::EngineConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command '{command}' timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("Command '{command}' exited with code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("I/O error running '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Empty command line")]
    EmptyCommand,
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Options for a single subprocess invocation
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub env: HashMap<String, String>,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}

/// Captured result of a completed subprocess
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Seam between the engine and the host: everything above the executor talks
/// to subprocesses through this trait so tests can substitute scripted output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String], opts: &ExecOptions) -> Result<CommandOutput>;
}

/// Spawns and supervises host subprocesses.
///
/// A command that exceeds its timeout receives SIGTERM, then SIGKILL after
/// the configured grace period. Output is fully captured; streaming callers
/// use [`CommandExecutor::stream_execute`] instead.
pub struct CommandExecutor {
    default_timeout: Duration,
    kill_grace: Duration,
}

impl CommandExecutor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            default_timeout: config.command_timeout(),
            kill_grace: config.kill_grace(),
        }
    }

    pub fn with_timeouts(default_timeout: Duration, kill_grace: Duration) -> Self {
        Self {
            default_timeout,
            kill_grace,
        }
    }

    /// Run a command to completion, capturing stdout and stderr.
    ///
    /// A non-zero exit code is not an error here: callers that need to branch
    /// on the runtime's exit paths (not-found vs. real failure) inspect the
    /// returned output. Use [`CommandExecutor::execute_checked`] when any
    /// non-zero exit should fail.
    pub async fn execute(&self, argv: &[String], opts: &ExecOptions) -> Result<CommandOutput> {
        let command_line = argv.join(" ");
        let (program, args) = argv.split_first().ok_or(ExecutorError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ExecutorError::SpawnFailed {
            command: command_line.clone(),
            source,
        })?;
        let pid = child.id();

        let stdout_task = child.stdout.take().map(read_to_end);
        let stderr_task = child.stderr.take().map(read_to_end);

        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(wait_result) => wait_result.map_err(|source| ExecutorError::Io {
                command: command_line.clone(),
                source,
            })?,
            Err(_) => {
                warn!(
                    "Command '{}' exceeded {}ms, terminating",
                    command_line,
                    timeout.as_millis()
                );
                self.terminate(&mut child, pid).await;
                return Err(ExecutorError::Timeout {
                    command: command_line,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;

        debug!(
            "Command '{}' exited with {:?} in {}ms",
            command_line,
            status.code(),
            start.elapsed().as_millis()
        );

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
            duration: start.elapsed(),
        })
    }

    /// Like [`CommandExecutor::execute`], but a non-zero exit code becomes
    /// [`ExecutorError::CommandFailed`] carrying the captured stderr.
    pub async fn execute_checked(
        &self,
        argv: &[String],
        opts: &ExecOptions,
    ) -> Result<CommandOutput> {
        let output = self.execute(argv, opts).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ExecutorError::CommandFailed {
                command: argv.join(" "),
                exit_code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }

    /// Spawn a long-running command and expose its output as line streams.
    pub fn stream_execute(&self, argv: &[String], opts: &ExecOptions) -> Result<StreamHandle> {
        let command_line = argv.join(" ");
        let (program, args) = argv.split_first().ok_or(ExecutorError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| ExecutorError::SpawnFailed {
            command: command_line.clone(),
            source,
        })?;

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();

        if let Some(out) = child.stdout.take() {
            spawn_line_reader(out, stdout_tx);
        }
        if let Some(err) = child.stderr.take() {
            spawn_line_reader(err, stderr_tx);
        }

        Ok(StreamHandle {
            stdout: stdout_rx,
            stderr: stderr_rx,
            child,
            kill_grace: self.kill_grace,
            command: command_line,
        })
    }

    /// SIGTERM, then SIGKILL after the grace period.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        #[cfg(unix)]
        if let Some(pid) = pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                // Process may have exited between the timeout and the signal
                debug!("SIGTERM delivery to pid {} failed: {}", pid, e);
            }
            if tokio::time::timeout(self.kill_grace, child.wait())
                .await
                .is_ok()
            {
                return;
            }
            warn!("Process {} survived SIGTERM, sending SIGKILL", pid);
        }

        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Handle over a streaming subprocess: line receivers plus controlled shutdown.
pub struct StreamHandle {
    pub stdout: mpsc::UnboundedReceiver<String>,
    pub stderr: mpsc::UnboundedReceiver<String>,
    child: Child,
    kill_grace: Duration,
    command: String,
}

impl StreamHandle {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Send SIGTERM and await exit, escalating to SIGKILL after the grace
    /// period. A process that already exited is not an error.
    pub async fn stop(mut self) -> Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM delivery to pid {} failed: {}", pid, e);
            }
        }

        match tokio::time::timeout(self.kill_grace, self.child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(
                    "Streaming command '{}' survived SIGTERM, sending SIGKILL",
                    self.command
                );
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
                Ok(())
            }
        }
    }

    /// Wait for the process to exit on its own.
    pub async fn wait(mut self) -> Result<i32> {
        let status = self.child.wait().await.map_err(|source| ExecutorError::Io {
            command: self.command.clone(),
            source,
        })?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[async_trait]
impl CommandRunner for CommandExecutor {
    async fn run(&self, argv: &[String], opts: &ExecOptions) -> Result<CommandOutput> {
        self.execute(argv, opts).await
    }
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

fn read_to_end<R>(reader: R) -> tokio::task::JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        let mut reader = reader;
        let _ = reader.read_to_end(&mut buf).await;
        buf
    })
}

async fn collect(task: Option<tokio::task::JoinHandle<Vec<u8>>>) -> String {
    match task {
        Some(handle) => String::from_utf8_lossy(&handle.await.unwrap_or_default()).into_owned(),
        None => String::new(),
    }
}
