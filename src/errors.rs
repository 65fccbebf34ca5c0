// src/errors.rs

//! Crate-wide error types.
//!
//! The taxonomy follows where an error can surface:
//! - [`GraphError`]: flow construction time only, never mid-run.
//! - [`TaskError`]: per attempt, absorbed by the task's retry policy.
//! - [`ControlError`]: returned to a control API caller, no state mutated.
//! - [`StoreError`]: the state store is unusable; fatal to the scheduler.

use std::time::Duration;

use thiserror::Error;

use crate::dag::TaskStatus;
use crate::run::RunId;
use crate::task::TaskId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("task '{0}' already exists in the flow")]
    DuplicateIdentity(TaskId),

    #[error("cycle detected in task graph: {}", format_cycle(.cycle))]
    CycleDetected { cycle: Vec<TaskId> },

    #[error("task '{task}' requires unknown task '{missing}'")]
    DanglingDependency { task: TaskId, missing: TaskId },

    #[error("flow '{0}' is no longer accepting task definitions")]
    FlowSealed(String),
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("execution failed: {message}")]
    ExecutionFailed { message: String, retryable: bool },

    #[error("executor lost the task: {0}")]
    ExecutorLost(String),

    #[error("task exceeded its maximum run duration of {0:?}")]
    Timeout(Duration),
}

impl TaskError {
    /// A failure the retry policy may absorb.
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::ExecutionFailed {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that must not be retried regardless of policy.
    pub fn fatal(message: impl Into<String>) -> Self {
        TaskError::ExecutionFailed {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::ExecutionFailed { retryable, .. } => *retryable,
            TaskError::ExecutorLost(_) | TaskError::Timeout(_) => true,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("unknown flow '{0}'")]
    UnknownFlow(String),

    #[error("unknown run '{0}'")]
    UnknownRun(RunId),

    #[error("flow '{flow}' has no task '{task}'")]
    UnknownTask { flow: String, task: TaskId },

    #[error("cannot {action} task '{task}' while it is {status}")]
    InvalidTransition {
        task: TaskId,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("run '{0}' has already finished")]
    RunFinished(RunId),

    #[error("flow '{0}' is not active")]
    FlowInactive(String),

    #[error("flow '{flow}' rejected: {source}")]
    InvalidGraph { flow: String, source: GraphError },

    #[error("scheduler is not running")]
    SchedulerStopped,
}

impl ControlError {
    /// Stable machine-readable code for control surface responses.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::UnknownFlow(_) => "unknown_flow",
            ControlError::UnknownRun(_) => "unknown_run",
            ControlError::UnknownTask { .. } => "unknown_task",
            ControlError::InvalidTransition { .. } | ControlError::RunFinished(_) => {
                "invalid_transition"
            }
            ControlError::FlowInactive(_) => "flow_inactive",
            ControlError::InvalidGraph { .. } => "invalid_graph",
            ControlError::SchedulerStopped => "scheduler_stopped",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("state store returned inconsistent data: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum DagflowError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, DagflowError>;
