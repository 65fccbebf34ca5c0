// src/exec/local.rs

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::errors::TaskError;
use crate::task::{Task, TaskContext, TaskFuture};

use super::Executor;

/// Runs each attempt as its own Tokio task in this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

/// Aborts the spawned attempt when the submitting future is dropped.
struct AbortOnDrop(JoinHandle<Result<(), TaskError>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Executor for LocalExecutor {
    fn submit(&self, task: Arc<Task>, ctx: TaskContext) -> TaskFuture {
        let task_id = ctx.task_id.clone();
        let mut guard = AbortOnDrop(tokio::spawn(async move { task.execute(ctx).await }));

        Box::pin(async move {
            match (&mut guard.0).await {
                Ok(result) => result,
                Err(err) if err.is_panic() => {
                    let message = panic_message(err.into_panic());
                    warn!(task = %task_id, %message, "task panicked");
                    Err(TaskError::ExecutorLost(format!("task panicked: {message}")))
                }
                Err(err) => Err(TaskError::ExecutorLost(err.to_string())),
            }
        })
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
