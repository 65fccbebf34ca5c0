// src/engine/events.rs

//! Notifications published by the scheduler for observers (a control
//! surface pushing updates, tests waiting for a run to end).
//!
//! Events are informational. They are sent after the matching state has
//! been committed to the store, and a lagging subscriber simply misses some.

use serde::Serialize;

use crate::dag::TaskStatus;
use crate::run::{RunId, RunStatus, Trigger};
use crate::task::TaskId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    RunStarted {
        run: RunId,
        trigger: Trigger,
    },
    TaskTransition {
        run: RunId,
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        attempt: u32,
    },
    RunFinished {
        run: RunId,
        status: RunStatus,
    },
}

impl SchedulerEvent {
    pub fn run(&self) -> &RunId {
        match self {
            SchedulerEvent::RunStarted { run, .. }
            | SchedulerEvent::TaskTransition { run, .. }
            | SchedulerEvent::RunFinished { run, .. } => run,
        }
    }
}
