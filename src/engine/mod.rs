// src/engine/mod.rs

//! Orchestration engine.
//!
//! The pure state machine lives in [`core`]: it owns every active run, the
//! ready queue and the in-flight table, and turns inputs into commands. The
//! async shell in [`runtime`] reads the event channel, drives the core and
//! carries out its commands against the executors.
//!
//! - [`control`] defines control commands, replies and the client handle.
//! - [`events`] defines notifications for observers.
//! - [`queue`] holds READY tasks waiting for a slot.

use crate::errors::TaskError;
use crate::run::RunId;
use crate::task::TaskId;

pub mod control;
pub mod core;
pub mod events;
pub mod queue;
pub mod runtime;

pub use control::{
    ControlCommand, ControlReply, ControlResult, RerunMode, RunStatusView, SchedulerHandle,
    TaskStatusView,
};
pub use core::{CoreCommand, CoreInput, CoreStep, Now, ScheduledTask, SchedulerCore};
pub use events::SchedulerEvent;
pub use queue::{QueueKey, ReadyQueue};
pub use runtime::Scheduler;

/// Events flowing into the scheduler loop from handles and running tasks.
#[derive(Debug)]
pub enum RuntimeEvent {
    /// A control command; the reply goes back on `reply`.
    Control {
        command: ControlCommand,
        reply: tokio::sync::oneshot::Sender<ControlResult>,
    },
    /// An attempt returned (or was lost by its executor).
    TaskFinished {
        run: RunId,
        task: TaskId,
        ticket: u64,
        outcome: Result<(), TaskError>,
    },
}
