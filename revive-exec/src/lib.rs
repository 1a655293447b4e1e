/// Privileged shell command execution.
///
/// Commands are handed to a shell prefix (`su -c` unless configured
/// otherwise). [`Privileged`] offers the blocking fire-and-forget and
/// wait-for-status forms; [`ExecQueue`] runs commands asynchronously, one at a
/// time in submission order, each bounded by a timeout.
use std::process::Stdio;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Shell prefix used when none is configured.
pub const DEFAULT_SHELL: [&str; 2] = ["su", "-c"];

/// Default per-command timeout for [`ExecQueue`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to spawn '{cmd}': {source}")]
    Spawn {
        cmd: String,
        source: std::io::Error,
    },
    #[error("'{cmd}' timed out after {}ms", timeout.as_millis())]
    Timeout { cmd: String, timeout: Duration },
    #[error("'{cmd}' exited with {code:?}: {stderr}")]
    Failed {
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("I/O error running '{cmd}': {source}")]
    Io {
        cmd: String,
        source: std::io::Error,
    },
    #[error("exec queue is shut down")]
    QueueClosed,
}

/// Shell prefix plus the command line as its final argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Privileged {
    shell: Vec<String>,
}

impl Default for Privileged {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL.iter().map(|s| s.to_string()).collect())
    }
}

impl Privileged {
    pub fn new(shell: Vec<String>) -> Self {
        Self { shell }
    }

    fn split<'a>(&'a self, cmd: &'a str) -> Result<(&'a str, Vec<&'a str>), ExecError> {
        let Some((program, prefix)) = self.shell.split_first() else {
            return Err(ExecError::Spawn {
                cmd: cmd.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty shell prefix"),
            });
        };
        let mut args: Vec<&str> = prefix.iter().map(String::as_str).collect();
        args.push(cmd);
        Ok((program.as_str(), args))
    }

    fn std_command(&self, cmd: &str) -> Result<std::process::Command, ExecError> {
        let (program, args) = self.split(cmd)?;
        let mut command = std::process::Command::new(program);
        command.args(args).stdin(Stdio::null());
        Ok(command)
    }

    /// Spawn `cmd` and return immediately. Spawn errors are logged.
    pub fn run_without_waiting(&self, cmd: &str) {
        let spawned = self.std_command(cmd).and_then(|mut c| {
            c.spawn().map_err(|e| ExecError::Spawn {
                cmd: cmd.to_string(),
                source: e,
            })
        });
        match spawned {
            Ok(mut child) => {
                tracing::debug!(cmd, pid = child.id(), "privileged command started");
                // Reaped off-thread so the caller never blocks on it.
                std::thread::spawn(move || {
                    let _ = child.wait();
                });
            }
            Err(e) => tracing::error!(error = %e, "privileged command not started"),
        }
    }

    /// Run `cmd` to completion. True only on exit status 0.
    pub fn run_and_wait(&self, cmd: &str) -> bool {
        let status = self.std_command(cmd).and_then(|mut c| {
            c.stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map_err(|e| ExecError::Spawn {
                    cmd: cmd.to_string(),
                    source: e,
                })
        });
        match status {
            Ok(status) => {
                tracing::debug!(cmd, code = ?status.code(), "privileged command finished");
                status.success()
            }
            Err(e) => {
                tracing::error!(error = %e, "privileged command failed to run");
                false
            }
        }
    }

    async fn run_with_timeout(&self, cmd: &str, timeout: Duration) -> Result<String, ExecError> {
        let (program, args) = self.split(cmd)?;
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Spawn {
                cmd: cmd.to_string(),
                source: e,
            })?;

        // On timeout the child is dropped, which kills it.
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecError::Timeout {
                cmd: cmd.to_string(),
                timeout,
            })?
            .map_err(|e| ExecError::Io {
                cmd: cmd.to_string(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(ExecError::Failed {
                cmd: cmd.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

struct Job {
    cmd: String,
    reply: oneshot::Sender<Result<String, ExecError>>,
}

/// Serial asynchronous runner.
///
/// A single worker task owns the shell and takes jobs in the order they were
/// submitted; the next job starts only after the previous one finished or was
/// killed. Create it inside a tokio runtime. The worker stops once every
/// clone of the queue is dropped.
#[derive(Clone)]
pub struct ExecQueue {
    jobs: mpsc::UnboundedSender<Job>,
}

impl ExecQueue {
    pub fn new(shell: Vec<String>, timeout: Duration) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(Privileged::new(shell), timeout, rx));
        Self { jobs }
    }

    /// Run `cmd` and return its stdout, or `None` on spawn failure, timeout
    /// or non-zero exit.
    pub async fn run(&self, cmd: &str) -> Option<String> {
        match self.run_checked(cmd).await {
            Ok(out) => Some(out),
            Err(e) => {
                tracing::warn!(error = %e, "queued command failed");
                None
            }
        }
    }

    /// Like [`run`](Self::run), with the failure reason.
    pub async fn run_checked(&self, cmd: &str) -> Result<String, ExecError> {
        let (reply, result) = oneshot::channel();
        self.jobs
            .send(Job {
                cmd: cmd.to_string(),
                reply,
            })
            .map_err(|_| ExecError::QueueClosed)?;
        result.await.map_err(|_| ExecError::QueueClosed)?
    }

    /// Queue `cmd` now and hand its result to `callback` when it finishes.
    pub fn submit<F>(&self, cmd: &str, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Option<String>) + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let queued = self
            .jobs
            .send(Job {
                cmd: cmd.to_string(),
                reply,
            })
            .is_ok();
        tokio::spawn(async move {
            if !queued {
                tracing::warn!("exec queue is shut down; command dropped");
                callback(None);
                return;
            }
            let output = match result.await {
                Ok(Ok(out)) => Some(out),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "queued command failed");
                    None
                }
                Err(_) => None,
            };
            callback(output);
        })
    }
}

async fn worker(shell: Privileged, timeout: Duration, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        tracing::debug!(cmd = %job.cmd, "running queued command");
        let result = shell.run_with_timeout(&job.cmd, timeout).await;
        // The caller may have stopped waiting.
        let _ = job.reply.send(result);
    }
    tracing::debug!("exec queue worker stopped");
}
