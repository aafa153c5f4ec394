//! Worker process launching

use super::WORKER_LOG_TARGET;
use crate::config::AgentConfig;
use crate::error::WorkerError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, error, warn};

/// How a worker process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when terminated by a signal
    pub code: Option<i32>,
    pub success: bool,
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

/// Lifecycle handle of a launched worker.
///
/// `wait` must be safe to call again after a previous `wait` future was
/// dropped before completing.
#[async_trait]
pub trait ProcessControl: Send {
    async fn wait(&mut self) -> io::Result<ExitInfo>;
    async fn kill(&mut self) -> io::Result<()>;
    fn id(&self) -> Option<u32>;
}

/// A freshly launched worker: its byte streams plus its lifecycle handle
pub struct WorkerProcess {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub control: Box<dyn ProcessControl>,
}

impl fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("pid", &self.control.id())
            .finish()
    }
}

/// Host capability that starts one worker generation
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, generation: u64) -> Result<WorkerProcess, WorkerError>;
}

/// Launches the worker as a child process talking over stdin/stdout
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        let mut launcher = Self::new(config.command.clone()).args(config.args.iter().cloned());
        launcher.env = config.env.clone();
        launcher.cwd = config.cwd.clone();
        launcher
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Background task to drain stderr so the worker can't block on a full pipe
    async fn read_stderr_task(stderr: ChildStderr, generation: u64) {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("Worker stderr closed (generation {})", generation);
                    break;
                }
                Ok(_) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        warn!(target: WORKER_LOG_TARGET, "stderr: {}", trimmed);
                    }
                }
                Err(e) => {
                    error!("Error reading worker stderr: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, generation: u64) -> Result<WorkerProcess, WorkerError> {
        debug!(
            "Spawning worker: {} {:?} (cwd: {:?}, generation {})",
            self.command, self.args, self.cwd, generation
        );

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            WorkerError::SpawnFailed(format!("Failed to spawn {}: {}", self.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::SpawnFailed("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::SpawnFailed("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| WorkerError::SpawnFailed("Failed to capture stderr".to_string()))?;

        tokio::spawn(Self::read_stderr_task(stderr, generation));

        Ok(WorkerProcess {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            control: Box::new(ChildControl { child }),
        })
    }
}

struct ChildControl {
    child: Child,
}

#[async_trait]
impl ProcessControl for ChildControl {
    async fn wait(&mut self) -> io::Result<ExitInfo> {
        self.child.wait().await.map(ExitInfo::from)
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }
}
