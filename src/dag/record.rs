// src/dag/record.rs

//! Per-run task records and the state machine that governs them.
//!
//! ```text
//! PENDING  -> READY | BLOCKED | SKIPPED (output already present) | CANCELLED
//! BLOCKED  -> READY | SKIPPED (upstream failed) | CANCELLED
//! READY    -> RUNNING | CANCELLED
//! RUNNING  -> SUCCEEDED | READY (retry) | FAILED | CANCELLED
//! any except RUNNING -> PENDING (operator rerun)
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Blocked,
    Ready,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl TaskStatus {
    /// Terminal for the current run; only a rerun leaves these.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Skipped
        )
    }

    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (Running, Pending) => false,
            (_, Pending) => true,
            (Pending, Ready | Blocked | Skipped | Cancelled) => true,
            (Blocked, Ready | Skipped | Cancelled) => true,
            (Ready, Running | Cancelled) => true,
            (Running, Succeeded | Ready | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Blocked => "BLOCKED",
            TaskStatus::Ready => "READY",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Cancelled => "CANCELLED",
            TaskStatus::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// Why a record ended up SKIPPED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Output markers were already present; counts as success downstream.
    Satisfied,
    /// An upstream requirement failed or was cancelled.
    UpstreamFailed,
}

/// Attempted a transition the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} is not a valid transition", self.from, self.to)
    }
}

/// Mutable per-run state of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub status: TaskStatus,
    /// 1-based number of the current (or last) attempt.
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub skip_reason: Option<SkipReason>,
}

impl Default for RunRecord {
    fn default() -> Self {
        Self::pending()
    }
}

impl RunRecord {
    pub fn pending() -> Self {
        Self {
            status: TaskStatus::Pending,
            attempt: 1,
            started_at: None,
            ended_at: None,
            last_error: None,
            skip_reason: None,
        }
    }

    /// Move to `to`, enforcing the state machine. Timestamps and attempt
    /// bookkeeping follow the transition.
    pub fn transition(&mut self, to: TaskStatus, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(InvalidTransition { from, to });
        }

        match to {
            TaskStatus::Pending => {
                *self = RunRecord::pending();
                return Ok(());
            }
            TaskStatus::Running => {
                self.started_at = Some(at);
                self.ended_at = None;
            }
            TaskStatus::Ready if from == TaskStatus::Running => {
                self.attempt += 1;
                self.ended_at = Some(at);
            }
            _ if to.is_terminal() => {
                self.ended_at = Some(at);
            }
            _ => {}
        }

        if to != TaskStatus::Skipped {
            self.skip_reason = None;
        }
        self.status = to;
        Ok(())
    }

    /// Transition to SKIPPED, recording why.
    pub fn skip(&mut self, reason: SkipReason, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Skipped, at)?;
        self.skip_reason = Some(reason);
        Ok(())
    }

    pub fn counts_as_success(&self) -> bool {
        match self.status {
            TaskStatus::Succeeded => true,
            TaskStatus::Skipped => self.skip_reason == Some(SkipReason::Satisfied),
            _ => false,
        }
    }

    /// Terminal without success: dependents can never become ready.
    pub fn is_dead(&self) -> bool {
        self.status.is_terminal() && !self.counts_as_success()
    }
}
