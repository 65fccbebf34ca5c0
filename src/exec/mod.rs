// src/exec/mod.rs

//! Execution layer.
//!
//! The scheduler hands every dispatched attempt to an [`Executor`] and waits
//! on the returned future for the outcome. Executors are pluggable so tests
//! can script outcomes and deployments can route tasks by hint.
//!
//! - [`local`] runs attempts as Tokio tasks in this process.
//! - [`command`] is a task behaviour that runs a shell command.

pub mod command;
pub mod local;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::task::{Task, TaskContext, TaskFuture};

pub use command::CommandTask;
pub use local::LocalExecutor;

/// Runs task attempts.
///
/// The returned future resolves to the attempt's outcome. Dropping it
/// abandons the attempt; a preemptible executor must stop the work when that
/// happens.
pub trait Executor: Send + Sync + fmt::Debug {
    fn submit(&self, task: Arc<Task>, ctx: TaskContext) -> TaskFuture;

    /// Whether dropping the submitted future stops the work. When false, an
    /// aborted attempt keeps running and its result is discarded.
    fn supports_preemption(&self) -> bool {
        true
    }
}

/// Default executor plus named executors selected by task hint.
#[derive(Debug, Clone)]
pub struct ExecutorRegistry {
    default: Arc<dyn Executor>,
    named: BTreeMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new(default: Arc<dyn Executor>) -> Self {
        Self {
            default,
            named: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, executor: Arc<dyn Executor>) {
        self.named.insert(name.into(), executor);
    }

    pub fn select(&self, hint: Option<&str>) -> &Arc<dyn Executor> {
        match hint {
            None => &self.default,
            Some(name) => self.named.get(name).unwrap_or_else(|| {
                warn!(executor = name, "unknown executor hint; using default executor");
                &self.default
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Detached;

    impl Executor for Detached {
        fn submit(&self, _task: Arc<Task>, _ctx: TaskContext) -> TaskFuture {
            Box::pin(async { Ok(()) })
        }

        fn supports_preemption(&self) -> bool {
            false
        }
    }

    #[test]
    fn hint_selects_named_executor_or_default() {
        let mut registry = ExecutorRegistry::new(Arc::new(LocalExecutor));
        registry.register("remote", Arc::new(Detached));

        assert!(registry.select(None).supports_preemption());
        assert!(!registry.select(Some("remote")).supports_preemption());
        assert!(registry.select(Some("gpu")).supports_preemption());
    }
}
