// src/flow/mod.rs

//! Flows: named, explicitly populated containers of tasks.
//!
//! A flow owns its task definitions and the dependency graph derived from
//! them. Its lifecycle is `Created -> Active -> Retired`: tasks can only be
//! added while `Created`, activation validates the whole graph, and a
//! retired flow accepts no new runs while existing runs finish.

pub mod recurrence;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::dag::{DagGraph, RunRecord};
use crate::errors::GraphError;
use crate::run::{Run, RunId, RunStatus, RunSummary, Trigger};
use crate::task::{Task, TaskId};

pub use recurrence::Recurrence;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowState {
    Created,
    Active,
    Retired,
}

#[derive(Debug, Clone)]
pub struct Flow {
    name: String,
    recurrence: Option<Recurrence>,
    state: FlowState,
    tasks: BTreeMap<TaskId, Arc<Task>>,
    graph: DagGraph,
    /// Cap on simultaneously RUNNING tasks across all runs of this flow.
    max_concurrent: Option<usize>,
}

impl Flow {
    pub fn create(name: impl Into<String>, recurrence: Option<Recurrence>) -> Self {
        Self {
            name: name.into(),
            recurrence,
            state: FlowState::Created,
            tasks: BTreeMap::new(),
            graph: DagGraph::new(),
            max_concurrent: None,
        }
    }

    pub fn with_max_concurrent(mut self, limit: usize) -> Self {
        self.max_concurrent = Some(limit.max(1));
        self
    }

    /// Register a task with this flow. Registration is the only way a task
    /// becomes visible to the flow.
    pub fn add_task(&mut self, task: Task) -> Result<TaskId, GraphError> {
        if self.state != FlowState::Created {
            return Err(GraphError::FlowSealed(self.name.clone()));
        }

        let id = task.id().clone();
        self.graph.add_task(&id, task.requires())?;
        debug!(flow = %self.name, task = %id, "task added");
        self.tasks.insert(id.clone(), Arc::new(task));
        Ok(id)
    }

    /// Validate the graph and make the flow eligible for scheduling.
    pub fn activate(&mut self) -> Result<(), GraphError> {
        match self.state {
            FlowState::Active => Ok(()),
            FlowState::Retired => Err(GraphError::FlowSealed(self.name.clone())),
            FlowState::Created => {
                self.graph.validate()?;
                self.state = FlowState::Active;
                info!(flow = %self.name, tasks = self.tasks.len(), "flow activated");
                Ok(())
            }
        }
    }

    /// Stop accepting new runs. Existing runs are unaffected.
    pub fn retire(&mut self) {
        if self.state != FlowState::Retired {
            info!(flow = %self.name, "flow retired");
        }
        self.state = FlowState::Retired;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == FlowState::Active
    }

    pub fn recurrence(&self) -> Option<Recurrence> {
        self.recurrence
    }

    pub fn max_concurrent(&self) -> Option<usize> {
        self.max_concurrent
    }

    pub fn graph(&self) -> &DagGraph {
        &self.graph
    }

    pub fn task(&self, id: &TaskId) -> Option<&Arc<Task>> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.tasks.values()
    }

    /// A new run with every task's record PENDING. The scheduler settles it
    /// into READY/BLOCKED right away.
    pub fn start_run(&self, seq: u64, trigger: Trigger, at: DateTime<Utc>) -> Run {
        let records = self
            .tasks
            .keys()
            .map(|id| (id.clone(), RunRecord::pending()))
            .collect();

        Run {
            summary: RunSummary {
                id: RunId::new(self.name.clone(), seq),
                trigger,
                trigger_time: at,
                status: RunStatus::Running,
                finished_at: None,
            },
            records,
        }
    }

    /// Whether the recurrence policy wants a new run now. Flows without a
    /// policy, or not active, are never due.
    pub fn is_run_due(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        self.is_active()
            && self
                .recurrence
                .is_some_and(|policy| policy.is_due(last_run, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::TaskStatus;
    use crate::task::Noop;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::builder(id, Arc::new(Noop))
            .requires(deps.iter().copied())
            .build()
    }

    #[test]
    fn activation_rejects_dangling_requirements() {
        let mut flow = Flow::create("f", None);
        flow.add_task(task("b", &["a"])).unwrap();
        assert!(matches!(
            flow.activate(),
            Err(GraphError::DanglingDependency { .. })
        ));
        assert_eq!(flow.state(), FlowState::Created);
    }

    #[test]
    fn tasks_cannot_be_added_after_activation() {
        let mut flow = Flow::create("f", None);
        flow.add_task(task("a", &[])).unwrap();
        flow.activate().unwrap();
        assert_eq!(
            flow.add_task(task("b", &[])).unwrap_err(),
            GraphError::FlowSealed("f".into())
        );
    }

    #[test]
    fn start_run_initialises_every_record_pending() {
        let mut flow = Flow::create("f", None);
        flow.add_task(task("a", &[])).unwrap();
        flow.add_task(task("b", &["a"])).unwrap();
        flow.activate().unwrap();

        let run = flow.start_run(3, Trigger::Manual, Utc::now());
        assert_eq!(run.id(), &RunId::new("f", 3));
        assert_eq!(run.records.len(), 2);
        assert!(run.records.values().all(|r| r.status == TaskStatus::Pending));
    }

    #[test]
    fn retired_flows_are_never_due() {
        let mut flow = Flow::create("f", Some(Recurrence::Daily { hour: 0, minute: 0 }));
        flow.add_task(task("a", &[])).unwrap();
        assert!(!flow.is_run_due(None, Utc::now()), "created flows are not scheduled");
        flow.activate().unwrap();
        assert!(flow.is_run_due(None, Utc::now()));
        flow.retire();
        assert!(!flow.is_run_due(None, Utc::now()));
    }
}
