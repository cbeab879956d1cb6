//! Adapter interfaces for running commands on the host.
//!
//! The engine never talks to a shell directly. It hands a `CommandSpec` to a
//! `CommandRunner`, which spawns the process, captures its output and
//! enforces the deadline.

pub mod shell;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

// Re-export the shell runner
pub use shell::ShellRunner;

/// Cancellation signal shared by everything in one run (`true` = cancel)
pub type CancelSignal = watch::Receiver<bool>;

/// Everything needed to start one process
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Script text handed to the shell
    pub script: String,

    /// Variables added on top of the inherited environment
    pub env: Vec<(String, String)>,

    /// Process working directory
    pub working_dir: PathBuf,

    /// Deadline for foreground runs (`None` = no deadline)
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Create a spec with no extra environment and no deadline
    pub fn new(script: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            env: Vec::new(),
            working_dir: working_dir.into(),
            timeout: None,
        }
    }

    /// Set the deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the extra environment
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }
}

/// Output captured from a finished process
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code (-1 when terminated by a signal)
    pub exit_code: i32,

    /// Standard output, lossily decoded
    pub stdout: String,

    /// Standard error, lossily decoded
    pub stderr: String,

    /// Wall time from spawn to exit
    pub duration_ms: u64,

    /// Killed for exceeding the deadline
    pub timed_out: bool,

    /// Killed because the run was cancelled or the handle was stopped
    pub cancelled: bool,
}

impl CommandOutput {
    /// Output of a process that exited on its own
    pub fn exited(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            ..Default::default()
        }
    }
}

/// A process running without blocking the step loop
pub struct BackgroundHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<io::Result<CommandOutput>>,
}

impl BackgroundHandle {
    /// Wrap a capture task and the sender that stops it
    pub fn new(stop: watch::Sender<bool>, task: JoinHandle<io::Result<CommandOutput>>) -> Self {
        Self { stop, task }
    }

    /// A handle whose process has already finished with `output`
    pub fn finished(output: CommandOutput) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            task: tokio::spawn(async move { Ok(output) }),
        }
    }

    /// Ask the process to stop without waiting for it
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Wait up to `grace` for a natural exit, then stop the process and
    /// collect whatever it produced.
    pub async fn join(mut self, grace: Duration) -> io::Result<CommandOutput> {
        if let Ok(joined) = timeout(grace, &mut self.task).await {
            return joined.map_err(io::Error::other)?;
        }
        self.stop();
        self.task.await.map_err(io::Error::other)?
    }
}

/// Trait for command runners
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Human-readable runner name
    fn name(&self) -> &str;

    /// Run to completion, honouring `spec.timeout` and `cancel`
    async fn run(&self, spec: &CommandSpec, cancel: CancelSignal) -> Result<CommandOutput>;

    /// Start a process and return immediately
    fn spawn_background(&self, spec: &CommandSpec) -> Result<BackgroundHandle>;
}

/// Resolve once `cancel` reads `true`; never resolves if the sender is gone
pub async fn cancelled(cancel: &mut CancelSignal) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
