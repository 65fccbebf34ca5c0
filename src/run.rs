// src/run.rs

//! Runs: one execution instance of a flow and its per-task records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::RunRecord;
use crate::task::TaskId;

/// Flow name plus a per-flow monotonic sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId {
    pub flow: String,
    pub seq: u64,
}

impl RunId {
    pub fn new(flow: impl Into<String>, seq: u64) -> Self {
        Self {
            flow: flow.into(),
            seq,
        }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.flow, self.seq)
    }
}

/// What caused a run to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// Explicit request through the control API.
    Manual,
    /// The flow's recurrence policy reported a run was due.
    Schedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Row of the runs table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub trigger: Trigger,
    pub trigger_time: DateTime<Utc>,
    pub status: RunStatus,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A run together with its task records.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub summary: RunSummary,
    pub records: BTreeMap<TaskId, RunRecord>,
}

impl Run {
    pub fn id(&self) -> &RunId {
        &self.summary.id
    }

    pub fn record(&self, task: &TaskId) -> Option<&RunRecord> {
        self.records.get(task)
    }

    pub fn is_finished(&self) -> bool {
        self.records.values().all(|r| r.status.is_terminal())
    }

    /// Overall outcome once every record is terminal.
    ///
    /// `cancelled` is set when the operator cancelled the run as a whole.
    pub fn final_status(&self, cancelled: bool) -> RunStatus {
        if cancelled {
            return RunStatus::Cancelled;
        }
        if self.records.values().all(|r| r.counts_as_success()) {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        }
    }
}
