// src/task/behavior.rs

//! The narrow capability a task definition holds: how to do its work and,
//! optionally, how to tell that the work is already done.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::errors::{StoreError, TaskError};
use crate::run::RunId;
use crate::store::StateStore;

use super::{Params, TaskId};

/// Boxed future returned by task behaviours and executors.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send + 'static>>;

/// Everything a single attempt gets to see.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: RunId,
    pub task_id: TaskId,
    /// 1-based attempt number within the run.
    pub attempt: u32,
    pub params: Params,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(
        run_id: RunId,
        task_id: TaskId,
        attempt: u32,
        params: Params,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            task_id,
            attempt,
            params,
            cancel,
        }
    }

    /// Fires when the operator cancels this task/run or the scheduler aborts it.
    ///
    /// Long-running behaviours should select on this to stop early.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Executable behaviour of a task.
///
/// `execute` may be invoked several times for the same task across attempts
/// and runs; the scheduler never runs two attempts of one task in the same
/// run concurrently.
pub trait TaskBehavior: Send + Sync + fmt::Debug {
    fn execute(&self, ctx: TaskContext) -> TaskFuture;

    /// Custom completion check. `None` defers to the task's output markers.
    fn is_complete(&self, _store: &dyn StateStore) -> Result<Option<bool>, StoreError> {
        Ok(None)
    }
}

struct FnBehavior<F> {
    f: F,
}

impl<F> fmt::Debug for FnBehavior<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnBehavior").finish_non_exhaustive()
    }
}

impl<F, Fut> TaskBehavior for FnBehavior<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    fn execute(&self, ctx: TaskContext) -> TaskFuture {
        Box::pin((self.f)(ctx))
    }
}

/// Wrap an async closure as a task behaviour.
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn TaskBehavior>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    Arc::new(FnBehavior { f })
}

/// Behaviour that succeeds immediately; useful for grouping tasks whose only
/// purpose is to depend on others.
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

impl TaskBehavior for Noop {
    fn execute(&self, _ctx: TaskContext) -> TaskFuture {
        Box::pin(async { Ok(()) })
    }
}
