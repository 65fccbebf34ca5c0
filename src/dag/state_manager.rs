// src/dag/state_manager.rs

//! Per-run state transitions.
//!
//! Every status change of a run record goes through [`StateManager::apply`],
//! which enforces the state machine, writes the record to the state store
//! and logs the transition for observers. A store write failure is returned
//! to the caller; everything else is contained.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::dag::record::{RunRecord, SkipReason, TaskStatus};
use crate::errors::StoreError;
use crate::flow::Flow;
use crate::run::Run;
use crate::store::StateStore;
use crate::task::TaskId;

/// One applied status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub task: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Mutable view over one run while the scheduler works on it.
pub struct StateManager<'a> {
    flow: &'a Flow,
    run: &'a mut Run,
    store: &'a dyn StateStore,
    /// Tasks whose completeness check is bypassed (explicit reruns).
    forced: &'a HashSet<TaskId>,
    log: &'a mut Vec<Transition>,
}

impl<'a> StateManager<'a> {
    pub fn new(
        flow: &'a Flow,
        run: &'a mut Run,
        store: &'a dyn StateStore,
        forced: &'a HashSet<TaskId>,
        log: &'a mut Vec<Transition>,
    ) -> Self {
        Self {
            flow,
            run,
            store,
            forced,
            log,
        }
    }

    pub fn status_of(&self, task: &TaskId) -> Option<TaskStatus> {
        self.run.records.get(task).map(|r| r.status)
    }

    /// Apply a transition and persist it.
    ///
    /// Returns `Ok(false)` when the state machine refuses the transition; the
    /// record is left untouched in that case.
    pub fn apply(&mut self, task: &TaskId, to: TaskStatus, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.apply_with(task, to, at, |_| {})
    }

    /// Like [`apply`](Self::apply), then lets the caller fill in fields such
    /// as `last_error` before the record is written.
    pub fn apply_with(
        &mut self,
        task: &TaskId,
        to: TaskStatus,
        at: DateTime<Utc>,
        edit: impl FnOnce(&mut RunRecord),
    ) -> Result<bool, StoreError> {
        let run_id = self.run.summary.id.clone();
        let Some(record) = self.run.records.get_mut(task) else {
            error!(run = %run_id, task = %task, "transition for task without a record");
            return Ok(false);
        };

        let from = record.status;
        if let Err(err) = record.transition(to, at) {
            error!(run = %run_id, task = %task, %err, "refusing transition");
            return Ok(false);
        }
        edit(record);

        self.store.put_record(&run_id, task, record)?;
        debug!(run = %run_id, task = %task, %from, %to, attempt = record.attempt, "transition");
        self.log.push(Transition {
            task: task.clone(),
            from,
            to,
        });
        Ok(true)
    }

    fn skip(&mut self, task: &TaskId, reason: SkipReason, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.apply_with(task, TaskStatus::Skipped, at, |r| r.skip_reason = Some(reason))
    }

    fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.run
            .records
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Drive PENDING and BLOCKED records as far as the graph allows.
    ///
    /// - PENDING with output markers present -> SKIPPED (satisfied), unless forced.
    /// - PENDING/BLOCKED with every requirement satisfied -> READY.
    /// - remaining PENDING -> BLOCKED.
    /// - BLOCKED with a dead requirement -> SKIPPED (upstream failed).
    ///
    /// Repeats until nothing changes and returns the tasks that became READY.
    pub fn settle(&mut self, at: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError> {
        let mut newly_ready = Vec::new();

        loop {
            let mut changed = false;

            for id in self.ids_with_status(TaskStatus::Pending) {
                if self.forced.contains(&id) {
                    continue;
                }
                let complete = match self.flow.task(&id) {
                    Some(task) => task.is_complete(self.store)?,
                    None => false,
                };
                if complete {
                    info!(run = %self.run.summary.id, task = %id, "output already present; skipping");
                    changed |= self.skip(&id, SkipReason::Satisfied, at)?;
                }
            }

            for id in self.flow.graph().ready_set(&self.run.records) {
                if self.apply(&id, TaskStatus::Ready, at)? {
                    newly_ready.push(id);
                    changed = true;
                }
            }

            for id in self.ids_with_status(TaskStatus::Pending) {
                changed |= self.apply(&id, TaskStatus::Blocked, at)?;
            }

            for id in self.flow.graph().doomed_set(&self.run.records) {
                info!(run = %self.run.summary.id, task = %id, "requirement failed; skipping");
                changed |= self.skip(&id, SkipReason::UpstreamFailed, at)?;
            }

            if !changed {
                break;
            }
        }

        Ok(newly_ready)
    }

    /// Mark every non-terminal record CANCELLED. Returns the tasks that were
    /// RUNNING and need an abort request.
    pub fn cancel_open(&mut self, at: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError> {
        let open: Vec<(TaskId, TaskStatus)> = self
            .run
            .records
            .iter()
            .filter(|(_, r)| !r.status.is_terminal())
            .map(|(id, r)| (id.clone(), r.status))
            .collect();

        let mut was_running = Vec::new();
        for (id, status) in open {
            if self.apply(&id, TaskStatus::Cancelled, at)? && status == TaskStatus::Running {
                was_running.push(id);
            }
        }
        Ok(was_running)
    }

    /// Reset the given records to PENDING for a rerun.
    pub fn reset_for_rerun<'t>(
        &mut self,
        targets: impl IntoIterator<Item = &'t TaskId>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        for id in targets {
            self.apply(id, TaskStatus::Pending, at)?;
        }
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.run.is_finished()
    }
}
