//! Host shell runner.
//!
//! Spawns `<shell> -c <script>` in its own process group so that a timeout
//! or cancellation can take down everything the script started, not just
//! the shell itself.

use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{cancelled, BackgroundHandle, CancelSignal, CommandOutput, CommandRunner, CommandSpec};

/// Time between the polite signal and the forced kill
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// How long to keep reading pipes after the shell exits
const IO_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runner that delegates to a host shell
pub struct ShellRunner {
    /// Shell binary (default: "bash")
    shell: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellRunner {
    /// Create a runner using bash
    pub fn new() -> Self {
        Self::with_shell("bash")
    }

    /// Create a runner using a custom shell binary
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Shell binary this runner invokes
    pub fn shell(&self) -> &str {
        &self.shell
    }

    fn spawn(&self, spec: &CommandSpec) -> Result<Child> {
        let mut command = std::process::Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&spec.script)
            .current_dir(&spec.working_dir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut command = Command::from(command);
        command.kill_on_drop(true);

        command.spawn().with_context(|| {
            format!(
                "Failed to spawn '{}' in {}",
                self.shell,
                spec.working_dir.display()
            )
        })
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    fn name(&self) -> &str {
        &self.shell
    }

    async fn run(&self, spec: &CommandSpec, cancel: CancelSignal) -> Result<CommandOutput> {
        let child = self.spawn(spec)?;
        capture(child, spec.timeout, cancel)
            .await
            .context("Failed to wait for shell process")
    }

    fn spawn_background(&self, spec: &CommandSpec) -> Result<BackgroundHandle> {
        let child = self.spawn(spec)?;
        let (stop, stop_rx) = watch::channel(false);
        let deadline = spec.timeout;
        let task = tokio::spawn(async move { capture(child, deadline, stop_rx).await });
        Ok(BackgroundHandle::new(stop, task))
    }
}

/// Why the wait ended
enum Ending {
    Exited(i32),
    TimedOut,
    Cancelled,
}

/// Wait for `child`, collecting both pipes, until it exits, the deadline
/// passes, or `cancel` fires.
async fn capture(
    mut child: Child,
    deadline: Option<Duration>,
    mut cancel: CancelSignal,
) -> io::Result<CommandOutput> {
    let started = Instant::now();
    let stdout = Arc::new(Mutex::new(Vec::new()));
    let stderr = Arc::new(Mutex::new(Vec::new()));
    let stdout_task = child.stdout.take().map(|s| drain(s, Arc::clone(&stdout)));
    let stderr_task = child.stderr.take().map(|s| drain(s, Arc::clone(&stderr)));

    let sleep = async {
        match deadline {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(sleep);

    let ending = tokio::select! {
        status = child.wait() => Ending::Exited(status?.code().unwrap_or(-1)),
        _ = &mut sleep => {
            terminate(&mut child).await;
            Ending::TimedOut
        }
        _ = cancelled(&mut cancel) => {
            terminate(&mut child).await;
            Ending::Cancelled
        }
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    finish_drain(stdout_task).await;
    finish_drain(stderr_task).await;

    let take = |buffer: &Arc<Mutex<Vec<u8>>>| {
        let bytes = buffer.lock().map(|b| b.clone()).unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    };

    let (exit_code, timed_out, was_cancelled) = match ending {
        Ending::Exited(code) => (code, false, false),
        Ending::TimedOut => (-1, true, false),
        Ending::Cancelled => (-1, false, true),
    };

    Ok(CommandOutput {
        exit_code,
        stdout: take(&stdout),
        stderr: take(&stderr),
        duration_ms,
        timed_out,
        cancelled: was_cancelled,
    })
}

/// Copy a pipe into a shared buffer until EOF
fn drain<R>(mut reader: R, buffer: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut b) = buffer.lock() {
                        b.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}

/// Give a pipe reader a bounded time to hit EOF.
///
/// A grandchild that left the process group can hold a pipe open forever.
async fn finish_drain(task: Option<JoinHandle<()>>) {
    let Some(mut task) = task else {
        return;
    };
    if timeout(IO_DRAIN_TIMEOUT, &mut task).await.is_err() {
        warn!("Output pipe still open after process exit; keeping partial output");
        task.abort();
    }
}

/// SIGTERM the process group, then SIGKILL it if it lingers
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let group = -(pid as libc::pid_t);
            debug!(pid, "Sending SIGTERM to process group");
            // SAFETY: kill(2) with a negative pid only signals that process group
            unsafe {
                libc::kill(group, libc::SIGTERM);
            }
            if timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
                return;
            }
            debug!(pid, "Process group ignored SIGTERM, sending SIGKILL");
            // SAFETY: as above
            unsafe {
                libc::kill(group, libc::SIGKILL);
            }
        }
    }

    let _ = child.kill().await;
}
