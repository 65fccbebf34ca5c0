// src/exec/command.rs

//! Shell command task behaviour.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::errors::TaskError;
use crate::task::{TaskBehavior, TaskContext, TaskFuture, TaskId};

/// Runs a command line through the platform shell.
///
/// A non-zero exit is a retryable failure; failing to start the process at
/// all is not. Cancellation kills the child.
#[derive(Debug, Clone)]
pub struct CommandTask {
    command: String,
    cwd: Option<PathBuf>,
}

impl CommandTask {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    async fn run(self, ctx: TaskContext) -> Result<(), TaskError> {
        match self.run_inner(&ctx).await {
            Ok(Some(status)) if status.success() => Ok(()),
            Ok(Some(status)) => {
                let code = status.code().unwrap_or(-1);
                Err(TaskError::failed(format!("command exited with code {code}")))
            }
            Ok(None) => Err(TaskError::fatal("command cancelled")),
            Err(err) => {
                error!(task = %ctx.task_id, run = %ctx.run_id, error = %err, "task execution error");
                Err(TaskError::fatal(format!("{err:#}")))
            }
        }
    }

    /// `None` when cancelled before the process exited.
    async fn run_inner(&self, ctx: &TaskContext) -> Result<Option<ExitStatus>> {
        info!(
            task = %ctx.task_id,
            run = %ctx.run_id,
            attempt = ctx.attempt,
            cmd = %self.command,
            "starting task process"
        );

        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&self.command);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&self.command);
            c
        };
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning process for task '{}'", ctx.task_id))?;

        if let Some(stdout) = child.stdout.take() {
            forward_lines(ctx.task_id.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(ctx.task_id.clone(), "stderr", stderr);
        }

        tokio::select! {
            status = child.wait() => {
                let status = status
                    .with_context(|| format!("waiting for process of task '{}'", ctx.task_id))?;
                info!(
                    task = %ctx.task_id,
                    exit_code = status.code().unwrap_or(-1),
                    success = status.success(),
                    "task process exited"
                );
                Ok(Some(status))
            }
            _ = ctx.cancellation().cancelled() => {
                info!(task = %ctx.task_id, "cancellation requested; killing process");
                if let Err(e) = child.kill().await {
                    warn!(task = %ctx.task_id, error = %e, "failed to kill child process");
                }
                Ok(None)
            }
        }
    }
}

impl TaskBehavior for CommandTask {
    fn execute(&self, ctx: TaskContext) -> TaskFuture {
        Box::pin(self.clone().run(ctx))
    }
}

/// Drain a child pipe so it never fills, logging each line.
fn forward_lines<R>(task: TaskId, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(task = %task, stream, "{}", line);
        }
    });
}
