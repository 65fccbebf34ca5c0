// src/engine/control.rs

//! Control API: intents sent to the scheduler loop and their replies.
//!
//! Every command travels over the scheduler's event channel and is applied
//! by the loop between two state transitions, so callers never mutate run
//! records directly. [`SchedulerHandle`] is the typed client side; it is
//! cheap to clone and safe to use from any task.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::error;

use crate::dag::{RunRecord, SkipReason, TaskStatus};
use crate::engine::RuntimeEvent;
use crate::engine::events::SchedulerEvent;
use crate::errors::{ControlError, DagflowError};
use crate::flow::Flow;
use crate::run::{Run, RunId, RunStatus, RunSummary, Trigger};
use crate::task::TaskId;

/// How far a rerun reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerunMode {
    /// Only the named task goes back to PENDING.
    Single,
    /// The named task and every task that transitively requires it.
    #[default]
    Downstream,
}

impl FromStr for RerunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "single" => Ok(RerunMode::Single),
            "downstream" => Ok(RerunMode::Downstream),
            other => Err(format!(
                "invalid rerun mode: {other} (expected \"single\" or \"downstream\")"
            )),
        }
    }
}

impl fmt::Display for RerunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RerunMode::Single => "single",
            RerunMode::Downstream => "downstream",
        })
    }
}

#[derive(Debug)]
pub enum ControlCommand {
    TriggerRun { flow: String },
    RunStatus { run: RunId },
    ListRuns { flow: String },
    Rerun { run: RunId, task: TaskId, mode: RerunMode },
    CancelRun { run: RunId },
    CancelTask { run: RunId, task: TaskId },
    Pause { flow: String },
    Resume { flow: String },
    RetireFlow { flow: String },
    RegisterFlow { flow: Box<Flow> },
    Shutdown { drain: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlReply {
    RunStarted(RunId),
    Status(RunStatusView),
    Runs(Vec<RunSummary>),
    Ack,
}

pub type ControlResult = Result<ControlReply, ControlError>;

/// Per-task row of a run status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatusView {
    pub task: TaskId,
    pub status: TaskStatus,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub skip_reason: Option<SkipReason>,
}

impl TaskStatusView {
    fn new(task: &TaskId, record: &RunRecord) -> Self {
        Self {
            task: task.clone(),
            status: record.status,
            attempt: record.attempt,
            started_at: record.started_at,
            ended_at: record.ended_at,
            error: record.last_error.clone(),
            skip_reason: record.skip_reason,
        }
    }
}

/// Committed state of one run, as returned by `run_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatusView {
    pub run: RunId,
    pub trigger: Trigger,
    pub trigger_time: DateTime<Utc>,
    pub status: RunStatus,
    pub finished_at: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskStatusView>,
}

impl RunStatusView {
    pub fn task(&self, task: &str) -> Option<&TaskStatusView> {
        self.tasks.iter().find(|t| t.task.as_str() == task)
    }

    pub fn status_of(&self, task: &str) -> Option<TaskStatus> {
        self.task(task).map(|t| t.status)
    }
}

impl From<&Run> for RunStatusView {
    fn from(run: &Run) -> Self {
        Self {
            run: run.summary.id.clone(),
            trigger: run.summary.trigger,
            trigger_time: run.summary.trigger_time,
            status: run.summary.status,
            finished_at: run.summary.finished_at,
            tasks: run
                .records
                .iter()
                .map(|(id, record)| TaskStatusView::new(id, record))
                .collect(),
        }
    }
}

/// Client side of the control API.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<RuntimeEvent>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    pub(crate) fn new(
        tx: mpsc::Sender<RuntimeEvent>,
        events: broadcast::Sender<SchedulerEvent>,
    ) -> Self {
        Self { tx, events }
    }

    /// Send a raw command and wait for the loop to apply it.
    pub async fn send(&self, command: ControlCommand) -> ControlResult {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RuntimeEvent::Control { command, reply })
            .await
            .map_err(|_| ControlError::SchedulerStopped)?;
        rx.await.map_err(|_| ControlError::SchedulerStopped)?
    }

    /// `POST /flows/{flow}/runs`
    pub async fn trigger_run(&self, flow: &str) -> Result<RunId, ControlError> {
        match self.send(ControlCommand::TriggerRun { flow: flow.to_string() }).await? {
            ControlReply::RunStarted(run) => Ok(run),
            other => Err(unexpected("trigger_run", other)),
        }
    }

    /// `GET /flows/{flow}/runs/{run}`
    pub async fn run_status(&self, run: &RunId) -> Result<RunStatusView, ControlError> {
        match self.send(ControlCommand::RunStatus { run: run.clone() }).await? {
            ControlReply::Status(view) => Ok(view),
            other => Err(unexpected("run_status", other)),
        }
    }

    pub async fn list_runs(&self, flow: &str) -> Result<Vec<RunSummary>, ControlError> {
        match self.send(ControlCommand::ListRuns { flow: flow.to_string() }).await? {
            ControlReply::Runs(runs) => Ok(runs),
            other => Err(unexpected("list_runs", other)),
        }
    }

    /// `POST /flows/{flow}/runs/{run}/tasks/{task}/rerun?mode=…`
    pub async fn rerun(&self, run: &RunId, task: impl Into<TaskId>, mode: RerunMode) -> Result<(), ControlError> {
        self.ack(ControlCommand::Rerun {
            run: run.clone(),
            task: task.into(),
            mode,
        })
        .await
    }

    /// `POST /flows/{flow}/runs/{run}/cancel`
    pub async fn cancel_run(&self, run: &RunId) -> Result<(), ControlError> {
        self.ack(ControlCommand::CancelRun { run: run.clone() }).await
    }

    pub async fn cancel_task(&self, run: &RunId, task: impl Into<TaskId>) -> Result<(), ControlError> {
        self.ack(ControlCommand::CancelTask {
            run: run.clone(),
            task: task.into(),
        })
        .await
    }

    /// `POST /flows/{flow}/pause`
    pub async fn pause(&self, flow: &str) -> Result<(), ControlError> {
        self.ack(ControlCommand::Pause { flow: flow.to_string() }).await
    }

    /// `POST /flows/{flow}/resume`
    pub async fn resume(&self, flow: &str) -> Result<(), ControlError> {
        self.ack(ControlCommand::Resume { flow: flow.to_string() }).await
    }

    pub async fn retire_flow(&self, flow: &str) -> Result<(), ControlError> {
        self.ack(ControlCommand::RetireFlow { flow: flow.to_string() }).await
    }

    /// Activate `flow` and hand it to the running scheduler. Graph errors are
    /// reported here, before anything reaches the loop.
    pub async fn register_flow(&self, mut flow: Flow) -> Result<(), DagflowError> {
        flow.activate()?;
        self.ack(ControlCommand::RegisterFlow { flow: Box::new(flow) }).await?;
        Ok(())
    }

    /// Stop the scheduler. With `drain`, dispatch stops and the loop exits
    /// once in-flight tasks finish; otherwise in-flight work is aborted.
    pub async fn shutdown(&self, drain: bool) -> Result<(), ControlError> {
        self.ack(ControlCommand::Shutdown { drain }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    async fn ack(&self, command: ControlCommand) -> Result<(), ControlError> {
        match self.send(command).await? {
            ControlReply::Ack => Ok(()),
            other => Err(unexpected("ack", other)),
        }
    }
}

fn unexpected(call: &str, reply: ControlReply) -> ControlError {
    error!(call, ?reply, "scheduler sent a reply of the wrong kind");
    ControlError::SchedulerStopped
}
