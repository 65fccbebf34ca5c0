// src/engine/core.rs

//! Synchronous scheduler core.
//!
//! [`SchedulerCore`] consumes one [`CoreInput`] at a time (a control
//! command, a task result, or a timer tick) and returns a [`CoreStep`]:
//! - commands for the async shell (dispatch tasks, abort attempts),
//! - events for observers,
//! - the reply to a control command, if any,
//! - whether the loop should keep running.
//!
//! It owns every active run and is the only code that changes run records.
//! It has no channels, no Tokio types and no clock of its own: the caller
//! passes [`Now`] in, which keeps the whole state machine unit-testable.
//! The state store is called synchronously; any store error aborts the step
//! and is fatal to the scheduler.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::dag::{RunRecord, StateManager, TaskStatus, Transition};
use crate::engine::control::{ControlCommand, ControlReply, ControlResult, RerunMode, RunStatusView};
use crate::engine::events::SchedulerEvent;
use crate::engine::queue::{QueueKey, ReadyQueue};
use crate::errors::{ControlError, DagflowError, StoreError, TaskError};
use crate::flow::{Flow, FlowState};
use crate::run::{Run, RunId, RunStatus, RunSummary, Trigger};
use crate::store::{self, StateStore};
use crate::task::{RetryPolicy, Task, TaskId};

/// Monotonic and wall-clock time of one step.
#[derive(Debug, Clone, Copy)]
pub struct Now {
    pub instant: Instant,
    pub wall: DateTime<Utc>,
}

impl Now {
    pub fn current() -> Self {
        Self {
            instant: Instant::now(),
            wall: Utc::now(),
        }
    }

    pub fn advance(self, by: Duration) -> Self {
        Self {
            instant: self.instant + by,
            wall: self.wall + TimeDelta::from_std(by).unwrap_or(TimeDelta::zero()),
        }
    }
}

/// One attempt handed to the shell for execution.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub run: RunId,
    pub task: Arc<Task>,
    pub attempt: u32,
    /// Unique per dispatch; results carrying another ticket are stale.
    pub ticket: u64,
    pub timeout: Option<Duration>,
}

/// Command produced by the core, to be executed by the async shell.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    Dispatch(Vec<ScheduledTask>),
    /// Best-effort abort of one in-flight attempt.
    Abort { run: RunId, task: TaskId, ticket: u64 },
}

#[derive(Debug)]
pub enum CoreInput {
    Control(ControlCommand),
    TaskFinished {
        run: RunId,
        task: TaskId,
        ticket: u64,
        outcome: Result<(), TaskError>,
    },
    Tick,
}

/// Decision returned by the core after handling a single input.
#[derive(Debug)]
pub struct CoreStep {
    pub commands: Vec<CoreCommand>,
    pub events: Vec<SchedulerEvent>,
    pub reply: Option<ControlResult>,
    pub keep_running: bool,
}

/// Why a control command did not produce a reply.
#[derive(Debug)]
enum Failure {
    /// Returned to the caller; nothing was changed.
    Rejected(ControlError),
    /// The scheduler cannot continue.
    Fatal(DagflowError),
}

impl From<ControlError> for Failure {
    fn from(err: ControlError) -> Self {
        Failure::Rejected(err)
    }
}

impl From<StoreError> for Failure {
    fn from(err: StoreError) -> Self {
        Failure::Fatal(err.into())
    }
}

impl From<DagflowError> for Failure {
    fn from(err: DagflowError) -> Self {
        Failure::Fatal(err)
    }
}

impl From<Failure> for DagflowError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Rejected(err) => err.into(),
            Failure::Fatal(err) => err,
        }
    }
}

#[derive(Debug)]
struct FlowEntry {
    flow: Arc<Flow>,
    paused: bool,
    next_seq: u64,
    /// In-flight attempts across all runs of this flow.
    running: usize,
    last_trigger: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct ActiveRun {
    /// Definition the run was started with.
    flow: Arc<Flow>,
    run: Run,
    /// Rerun targets whose completeness check is bypassed until dispatched.
    forced: HashSet<TaskId>,
    cancelled: bool,
}

impl ActiveRun {
    fn new(flow: Arc<Flow>, run: Run) -> Self {
        Self {
            flow,
            run,
            forced: HashSet::new(),
            cancelled: false,
        }
    }

    fn id(&self) -> &RunId {
        &self.run.summary.id
    }

    fn manager<'a>(
        &'a mut self,
        store: &'a dyn StateStore,
        log: &'a mut Vec<Transition>,
    ) -> StateManager<'a> {
        StateManager::new(&self.flow, &mut self.run, store, &self.forced, log)
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    ticket: u64,
    attempt: u32,
    timeout: Option<Duration>,
    /// Past this instant without a result the attempt counts as timed out.
    deadline: Option<Instant>,
}

#[derive(Debug, Default)]
struct Outbox {
    commands: Vec<CoreCommand>,
    events: Vec<SchedulerEvent>,
}

#[derive(Debug)]
pub struct SchedulerCore {
    config: SchedulerConfig,
    store: Arc<dyn StateStore>,
    flows: BTreeMap<String, FlowEntry>,
    active: BTreeMap<RunId, ActiveRun>,
    queue: ReadyQueue,
    in_flight: HashMap<QueueKey, InFlight>,
    next_ticket: u64,
    draining: bool,
    stopping: bool,
    outbox: Outbox,
}

impl SchedulerCore {
    pub fn new(config: SchedulerConfig, store: Arc<dyn StateStore>) -> Self {
        Self {
            config,
            store,
            flows: BTreeMap::new(),
            active: BTreeMap::new(),
            queue: ReadyQueue::new(),
            in_flight: HashMap::new(),
            next_ticket: 1,
            draining: false,
            stopping: false,
            outbox: Outbox::default(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register (or replace) a flow and resume its unfinished runs from the
    /// store. Nothing is dispatched until the next step.
    pub fn register_flow(&mut self, mut flow: Flow, now: Now) -> Result<Vec<SchedulerEvent>, DagflowError> {
        flow.activate()?;
        self.install_flow(flow, now)?;
        Ok(std::mem::take(&mut self.outbox.events))
    }

    /// Handle a single input, updating core state and returning the
    /// resulting commands for the async shell.
    pub fn step(&mut self, input: CoreInput, now: Now) -> Result<CoreStep, DagflowError> {
        let reply = match input {
            CoreInput::Control(command) => match self.handle_control(command, now) {
                Ok(reply) => Some(Ok(reply)),
                Err(Failure::Rejected(err)) => {
                    debug!(code = err.code(), %err, "control command rejected");
                    Some(Err(err))
                }
                Err(Failure::Fatal(err)) => return Err(err),
            },
            CoreInput::TaskFinished {
                run,
                task,
                ticket,
                outcome,
            } => {
                self.task_finished(QueueKey::new(run, task), ticket, outcome, now)?;
                None
            }
            CoreInput::Tick => {
                self.tick(now)?;
                None
            }
        };

        self.fill_slots(now)?;

        let outbox = std::mem::take(&mut self.outbox);
        Ok(CoreStep {
            commands: outbox.commands,
            events: outbox.events,
            reply,
            keep_running: self.keep_running(),
        })
    }

    pub fn keep_running(&self) -> bool {
        !(self.stopping || (self.draining && self.in_flight.is_empty()))
    }

    pub fn run(&self, id: &RunId) -> Option<&Run> {
        self.active.get(id).map(|a| &a.run)
    }

    pub fn active_runs(&self) -> impl Iterator<Item = &RunId> {
        self.active.keys()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// When the next retry backoff expires, if one is pending.
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        self.queue.next_not_before(now)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_paused(&self, flow: &str) -> bool {
        self.flows.get(flow).is_some_and(|e| e.paused)
    }

    fn handle_control(&mut self, command: ControlCommand, now: Now) -> Result<ControlReply, Failure> {
        match command {
            ControlCommand::TriggerRun { flow } => self
                .trigger_run(&flow, Trigger::Manual, now)
                .map(ControlReply::RunStarted),
            ControlCommand::RunStatus { run } => self.run_status(&run).map(ControlReply::Status),
            ControlCommand::ListRuns { flow } => {
                self.flow_entry(&flow)?;
                Ok(ControlReply::Runs(self.store.runs_for_flow(&flow)?))
            }
            ControlCommand::Rerun { run, task, mode } => {
                self.rerun(&run, &task, mode, now)?;
                Ok(ControlReply::Ack)
            }
            ControlCommand::CancelRun { run } => {
                self.cancel_run(&run, now)?;
                Ok(ControlReply::Ack)
            }
            ControlCommand::CancelTask { run, task } => {
                self.cancel_task(&run, &task, now)?;
                Ok(ControlReply::Ack)
            }
            ControlCommand::Pause { flow } => {
                self.flow_entry_mut(&flow)?.paused = true;
                info!(flow = %flow, "flow paused");
                Ok(ControlReply::Ack)
            }
            ControlCommand::Resume { flow } => {
                self.flow_entry_mut(&flow)?.paused = false;
                info!(flow = %flow, "flow resumed");
                Ok(ControlReply::Ack)
            }
            ControlCommand::RetireFlow { flow } => {
                let entry = self.flow_entry_mut(&flow)?;
                Arc::make_mut(&mut entry.flow).retire();
                Ok(ControlReply::Ack)
            }
            ControlCommand::RegisterFlow { flow } => {
                self.install_flow(*flow, now)?;
                Ok(ControlReply::Ack)
            }
            ControlCommand::Shutdown { drain } => {
                self.shutdown(drain);
                Ok(ControlReply::Ack)
            }
        }
    }

    fn flow_entry(&self, flow: &str) -> Result<&FlowEntry, ControlError> {
        self.flows
            .get(flow)
            .ok_or_else(|| ControlError::UnknownFlow(flow.to_string()))
    }

    fn flow_entry_mut(&mut self, flow: &str) -> Result<&mut FlowEntry, ControlError> {
        self.flows
            .get_mut(flow)
            .ok_or_else(|| ControlError::UnknownFlow(flow.to_string()))
    }

    /// Error for a run that is not active: finished if the store knows it.
    fn not_active(&self, run: &RunId) -> Result<ControlError, StoreError> {
        Ok(match self.store.get_run(run)? {
            Some(_) => ControlError::RunFinished(run.clone()),
            None => ControlError::UnknownRun(run.clone()),
        })
    }

    fn install_flow(&mut self, mut flow: Flow, now: Now) -> Result<(), Failure> {
        if flow.state() == FlowState::Retired {
            return Err(ControlError::FlowInactive(flow.name().to_string()).into());
        }
        if let Err(source) = flow.activate() {
            warn!(flow = %flow.name(), error = %source, "refusing invalid flow");
            return Err(ControlError::InvalidGraph {
                flow: flow.name().to_string(),
                source,
            }
            .into());
        }

        let name = flow.name().to_string();
        let flow = Arc::new(flow);
        let history = self.store.runs_for_flow(&name)?;
        let next_seq = history.iter().map(|s| s.id.seq).max().map_or(1, |seq| seq + 1);
        let last_trigger = history.iter().map(|s| s.trigger_time).max();

        match self.flows.get_mut(&name) {
            Some(entry) => {
                entry.flow = Arc::clone(&flow);
                entry.next_seq = entry.next_seq.max(next_seq);
                info!(flow = %name, "flow definition replaced");
            }
            None => {
                self.flows.insert(
                    name.clone(),
                    FlowEntry {
                        flow: Arc::clone(&flow),
                        paused: false,
                        next_seq,
                        running: 0,
                        last_trigger,
                    },
                );
                info!(flow = %name, tasks = flow.graph().len(), next_seq, "flow registered");
            }
        }

        let unfinished: Vec<RunSummary> = history
            .into_iter()
            .filter(|s| !s.status.is_terminal() && !self.active.contains_key(&s.id))
            .collect();
        for summary in unfinished {
            if let Some(run) = self.store.get_run(&summary.id)? {
                self.recover_run(Arc::clone(&flow), run, now)?;
            }
        }
        Ok(())
    }

    /// Resume a run a previous scheduler left unfinished. Attempts that were
    /// RUNNING are treated as lost by the executor.
    fn recover_run(&mut self, flow: Arc<Flow>, mut run: Run, now: Now) -> Result<(), StoreError> {
        let id = run.id().clone();
        info!(run = %id, "resuming unfinished run");

        for task in flow.tasks() {
            if !run.records.contains_key(task.id()) {
                let record = RunRecord::pending();
                self.store.put_record(&id, task.id(), &record)?;
                run.records.insert(task.id().clone(), record);
            }
        }

        let open: Vec<(TaskId, TaskStatus, u32)> = run
            .records
            .iter()
            .filter(|(_, r)| !r.status.is_terminal())
            .map(|(task, r)| (task.clone(), r.status, r.attempt))
            .collect();

        let store = Arc::clone(&self.store);
        let default_retry = self.config.default_retry;
        let mut active = ActiveRun::new(Arc::clone(&flow), run);
        let mut log = Vec::new();
        let mut requeue = Vec::new();
        {
            let mut mgr = active.manager(&*store, &mut log);
            for (task_id, status, attempt) in open {
                let Some(task) = flow.task(&task_id) else {
                    warn!(run = %id, task = %task_id, "task no longer defined; cancelling its record");
                    mgr.apply(&task_id, TaskStatus::Cancelled, now.wall)?;
                    continue;
                };
                match status {
                    TaskStatus::Running => {
                        let lost = TaskError::ExecutorLost(
                            "scheduler restarted while the task was running".to_string(),
                        );
                        if let Some(at) = fail_attempt(&mut mgr, task, attempt, &lost, default_retry, now)? {
                            requeue.push((task_id, at));
                        }
                    }
                    TaskStatus::Ready => requeue.push((task_id, now.instant)),
                    _ => {}
                }
            }
        }

        self.record_transitions(&active.run, log);
        for (task, at) in requeue {
            self.queue.push(QueueKey::new(id.clone(), task), Some(at));
        }
        self.advance(active, now)
    }

    fn trigger_run(&mut self, flow: &str, trigger: Trigger, now: Now) -> Result<RunId, Failure> {
        if self.draining || self.stopping {
            return Err(ControlError::SchedulerStopped.into());
        }
        let entry = self
            .flows
            .get_mut(flow)
            .ok_or_else(|| ControlError::UnknownFlow(flow.to_string()))?;
        if !entry.flow.is_active() {
            return Err(ControlError::FlowInactive(flow.to_string()).into());
        }

        let seq = entry.next_seq;
        entry.next_seq += 1;
        entry.last_trigger = Some(now.wall);
        let flow = Arc::clone(&entry.flow);

        let run = flow.start_run(seq, trigger, now.wall);
        store::put_full_run(&*self.store, &run)?;

        let id = run.id().clone();
        info!(run = %id, ?trigger, tasks = run.records.len(), "run started");
        self.outbox.events.push(SchedulerEvent::RunStarted {
            run: id.clone(),
            trigger,
        });

        self.advance(ActiveRun::new(flow, run), now)?;
        Ok(id)
    }

    fn run_status(&self, run: &RunId) -> Result<RunStatusView, Failure> {
        if let Some(active) = self.active.get(run) {
            return Ok(RunStatusView::from(&active.run));
        }
        match self.store.get_run(run)? {
            Some(stored) => Ok(RunStatusView::from(&stored)),
            None => Err(ControlError::UnknownRun(run.clone()).into()),
        }
    }

    fn rerun(&mut self, run: &RunId, task: &TaskId, mode: RerunMode, now: Now) -> Result<(), Failure> {
        if self.draining || self.stopping {
            return Err(ControlError::SchedulerStopped.into());
        }

        let (mut active, targets) = match self.active.get(run) {
            Some(active) => {
                let targets = rerun_targets(&active.flow, &active.run, task, mode)?;
                let Some(active) = self.active.remove(run) else {
                    return Err(ControlError::UnknownRun(run.clone()).into());
                };
                (active, targets)
            }
            None => {
                let stored = self
                    .store
                    .get_run(run)?
                    .ok_or_else(|| ControlError::UnknownRun(run.clone()))?;
                let flow = Arc::clone(&self.flow_entry(&run.flow)?.flow);
                let targets = rerun_targets(&flow, &stored, task, mode)?;

                let mut active = ActiveRun::new(flow, stored);
                active.run.summary.status = RunStatus::Running;
                active.run.summary.finished_at = None;
                self.store.put_run(&active.run.summary)?;
                info!(run = %run, "finished run reopened for rerun");
                (active, targets)
            }
        };

        let store = Arc::clone(&self.store);
        let mut log = Vec::new();
        active
            .manager(&*store, &mut log)
            .reset_for_rerun(&targets, now.wall)?;
        active.cancelled = false;
        for target in &targets {
            self.queue.remove(&QueueKey::new(run.clone(), target.clone()));
        }
        info!(run = %run, task = %task, %mode, reset = targets.len(), "rerun requested");
        active.forced.extend(targets);

        self.record_transitions(&active.run, log);
        self.advance(active, now)?;
        Ok(())
    }

    fn cancel_run(&mut self, run: &RunId, now: Now) -> Result<(), Failure> {
        let Some(mut active) = self.active.remove(run) else {
            return Err(self.not_active(run)?.into());
        };

        let store = Arc::clone(&self.store);
        let mut log = Vec::new();
        let was_running = active.manager(&*store, &mut log).cancel_open(now.wall)?;
        active.cancelled = true;
        self.record_transitions(&active.run, log);

        self.queue.remove_run(run);
        for task in was_running {
            self.abort(QueueKey::new(run.clone(), task));
        }
        info!(run = %run, "run cancelled");

        self.park(active, now)?;
        Ok(())
    }

    fn cancel_task(&mut self, run: &RunId, task: &TaskId, now: Now) -> Result<(), Failure> {
        let status = match self.active.get(run) {
            Some(active) => active
                .run
                .record(task)
                .map(|r| r.status)
                .ok_or_else(|| ControlError::UnknownTask {
                    flow: run.flow.clone(),
                    task: task.clone(),
                })?,
            None => return Err(self.not_active(run)?.into()),
        };
        if status.is_terminal() {
            return Err(ControlError::InvalidTransition {
                task: task.clone(),
                status,
                action: "cancel",
            }
            .into());
        }
        let Some(mut active) = self.active.remove(run) else {
            return Err(ControlError::UnknownRun(run.clone()).into());
        };

        let store = Arc::clone(&self.store);
        let mut log = Vec::new();
        active
            .manager(&*store, &mut log)
            .apply(task, TaskStatus::Cancelled, now.wall)?;
        self.record_transitions(&active.run, log);

        let key = QueueKey::new(run.clone(), task.clone());
        self.queue.remove(&key);
        if status == TaskStatus::Running {
            self.abort(key);
        }
        info!(run = %run, task = %task, "task cancelled");

        self.advance(active, now)?;
        Ok(())
    }

    fn shutdown(&mut self, drain: bool) {
        if drain {
            info!(in_flight = self.in_flight.len(), "draining; no further dispatch");
            self.draining = true;
            return;
        }

        info!(in_flight = self.in_flight.len(), "stopping; aborting in-flight tasks");
        self.stopping = true;
        let keys: Vec<QueueKey> = self.in_flight.keys().cloned().collect();
        for key in keys {
            self.abort(key);
        }
    }

    fn task_finished(
        &mut self,
        key: QueueKey,
        ticket: u64,
        outcome: Result<(), TaskError>,
        now: Now,
    ) -> Result<(), StoreError> {
        if self.in_flight.get(&key).is_none_or(|f| f.ticket != ticket) {
            warn!(
                run = %key.run,
                task = %key.task,
                ticket,
                "discarding result of an attempt that is no longer in flight"
            );
            return Ok(());
        }
        let Some(flight) = self.release(&key) else {
            return Ok(());
        };
        self.apply_outcome(key, flight.attempt, outcome, now)
    }

    fn apply_outcome(
        &mut self,
        key: QueueKey,
        attempt: u32,
        outcome: Result<(), TaskError>,
        now: Now,
    ) -> Result<(), StoreError> {
        let Some(mut active) = self.active.remove(&key.run) else {
            warn!(run = %key.run, task = %key.task, "result for a run that is no longer active");
            return Ok(());
        };

        let current = active.run.record(&key.task).map(|r| (r.status, r.attempt));
        let task = active.flow.task(&key.task).cloned();
        let (Some((TaskStatus::Running, running_attempt)), Some(task)) = (current, task) else {
            warn!(run = %key.run, task = %key.task, ?current, "discarding result for a task that is not running");
            self.active.insert(key.run, active);
            return Ok(());
        };
        if running_attempt != attempt {
            warn!(run = %key.run, task = %key.task, attempt, running_attempt, "discarding stale result");
            self.active.insert(key.run, active);
            return Ok(());
        }

        let store = Arc::clone(&self.store);
        let default_retry = self.config.default_retry;
        let mut log = Vec::new();
        let mut retry_at = None;
        {
            let mut mgr = active.manager(&*store, &mut log);
            match outcome {
                Ok(()) => {
                    mgr.apply(&key.task, TaskStatus::Succeeded, now.wall)?;
                    task.commit_outputs(&*store)?;
                    info!(run = %key.run, task = %key.task, attempt, "task succeeded");
                }
                Err(err) => {
                    retry_at = fail_attempt(&mut mgr, &task, attempt, &err, default_retry, now)?;
                }
            }
        }

        self.record_transitions(&active.run, log);
        if let Some(at) = retry_at {
            self.queue.push(key, Some(at));
        }
        self.advance(active, now)
    }

    fn tick(&mut self, now: Now) -> Result<(), DagflowError> {
        let expired: Vec<QueueKey> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline.is_some_and(|d| d <= now.instant))
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            let Some(flight) = self.release(&key) else {
                continue;
            };
            warn!(
                run = %key.run,
                task = %key.task,
                attempt = flight.attempt,
                "no result past timeout and grace; treating attempt as timed out"
            );
            self.outbox.commands.push(CoreCommand::Abort {
                run: key.run.clone(),
                task: key.task.clone(),
                ticket: flight.ticket,
            });
            let limit = flight.timeout.unwrap_or_default();
            self.apply_outcome(key, flight.attempt, Err(TaskError::Timeout(limit)), now)?;
        }

        if !(self.draining || self.stopping) {
            self.start_due_runs(now)?;
        }
        Ok(())
    }

    /// Start a run for every recurring flow whose policy says one is due.
    /// Paused flows and flows with a run still in progress are left alone.
    fn start_due_runs(&mut self, now: Now) -> Result<(), DagflowError> {
        let due: Vec<String> = self
            .flows
            .iter()
            .filter(|(name, entry)| {
                !entry.paused
                    && !self.active.keys().any(|id| id.flow.as_str() == name.as_str())
                    && entry.flow.is_run_due(entry.last_trigger, now.wall)
            })
            .map(|(name, _)| name.clone())
            .collect();

        for flow in due {
            match self.trigger_run(&flow, Trigger::Schedule, now) {
                Ok(run) => debug!(run = %run, "recurrence started a run"),
                Err(Failure::Rejected(err)) => debug!(flow = %flow, %err, "recurring run not started"),
                Err(Failure::Fatal(err)) => return Err(err),
            }
        }
        Ok(())
    }

    /// Move queued READY tasks to RUNNING while global and per-flow capacity
    /// remains.
    fn fill_slots(&mut self, now: Now) -> Result<(), StoreError> {
        if self.draining || self.stopping {
            return Ok(());
        }
        let capacity = self.config.max_concurrent.saturating_sub(self.in_flight.len());
        if capacity == 0 || self.queue.is_empty() {
            return Ok(());
        }

        let flows = &self.flows;
        let mut load: HashMap<String, usize> = HashMap::new();
        let picked = self.queue.take(capacity, |entry| {
            if entry.not_before.is_some_and(|t| t > now.instant) {
                return false;
            }
            let Some(flow) = flows.get(&entry.key.run.flow) else {
                return true;
            };
            if flow.paused {
                return false;
            }
            let running = load
                .entry(entry.key.run.flow.clone())
                .or_insert(flow.running);
            if flow.flow.max_concurrent().is_some_and(|cap| *running >= cap) {
                return false;
            }
            *running += 1;
            true
        });

        let mut dispatch = Vec::new();
        for key in picked {
            if let Some(task) = self.start_attempt(key, now)? {
                dispatch.push(task);
            }
        }
        if !dispatch.is_empty() {
            self.outbox.commands.push(CoreCommand::Dispatch(dispatch));
        }
        Ok(())
    }

    fn start_attempt(&mut self, key: QueueKey, now: Now) -> Result<Option<ScheduledTask>, StoreError> {
        let Some(mut active) = self.active.remove(&key.run) else {
            debug!(run = %key.run, task = %key.task, "dropping queued task of an inactive run");
            return Ok(None);
        };
        let Some(task) = active.flow.task(&key.task).cloned() else {
            warn!(run = %key.run, task = %key.task, "queued task is not part of the flow");
            self.active.insert(key.run, active);
            return Ok(None);
        };

        let store = Arc::clone(&self.store);
        let mut log = Vec::new();
        let started = active
            .manager(&*store, &mut log)
            .apply(&key.task, TaskStatus::Running, now.wall)?;
        self.record_transitions(&active.run, log);

        let mut scheduled = None;
        if started {
            active.forced.remove(&key.task);
            let attempt = active.run.record(&key.task).map_or(1, |r| r.attempt);
            let timeout = task.effective_timeout(self.config.default_timeout);
            let ticket = self.next_ticket;
            self.next_ticket += 1;

            self.in_flight.insert(
                key.clone(),
                InFlight {
                    ticket,
                    attempt,
                    timeout,
                    deadline: timeout.map(|t| now.instant + t + self.config.timeout_grace),
                },
            );
            if let Some(entry) = self.flows.get_mut(&key.run.flow) {
                entry.running += 1;
            }
            debug!(run = %key.run, task = %key.task, attempt, ticket, "dispatching");

            scheduled = Some(ScheduledTask {
                run: key.run.clone(),
                task,
                attempt,
                ticket,
                timeout,
            });
        }

        self.active.insert(key.run, active);
        Ok(scheduled)
    }

    /// Settle the run, queue what became ready, then finish or keep it.
    fn advance(&mut self, mut active: ActiveRun, now: Now) -> Result<(), StoreError> {
        let store = Arc::clone(&self.store);
        let mut log = Vec::new();
        let ready = active.manager(&*store, &mut log).settle(now.wall)?;
        self.record_transitions(&active.run, log);

        let id = active.id().clone();
        for task in ready {
            self.queue.push(QueueKey::new(id.clone(), task), None);
        }
        self.park(active, now)
    }

    fn park(&mut self, mut active: ActiveRun, now: Now) -> Result<(), StoreError> {
        if !active.run.is_finished() {
            self.active.insert(active.id().clone(), active);
            return Ok(());
        }

        let status = active.run.final_status(active.cancelled);
        active.run.summary.status = status;
        active.run.summary.finished_at = Some(now.wall);
        self.store.put_run(&active.run.summary)?;

        let id = active.id().clone();
        self.queue.remove_run(&id);
        info!(run = %id, ?status, "run finished");
        self.outbox
            .events
            .push(SchedulerEvent::RunFinished { run: id, status });
        Ok(())
    }

    fn release(&mut self, key: &QueueKey) -> Option<InFlight> {
        let flight = self.in_flight.remove(key)?;
        if let Some(entry) = self.flows.get_mut(&key.run.flow) {
            entry.running = entry.running.saturating_sub(1);
        }
        Some(flight)
    }

    /// Free the slot of an in-flight attempt and ask the shell to abort it.
    fn abort(&mut self, key: QueueKey) {
        if let Some(flight) = self.release(&key) {
            self.outbox.commands.push(CoreCommand::Abort {
                run: key.run,
                task: key.task,
                ticket: flight.ticket,
            });
        }
    }

    fn record_transitions(&mut self, run: &Run, log: Vec<Transition>) {
        for t in log {
            let attempt = run.record(&t.task).map_or(1, |r| r.attempt);
            self.outbox.events.push(SchedulerEvent::TaskTransition {
                run: run.summary.id.clone(),
                task: t.task,
                from: t.from,
                to: t.to,
                attempt,
            });
        }
    }
}

/// Record a failed attempt: back to READY if the retry policy absorbs it,
/// FAILED otherwise. Returns when the retry may be dispatched.
fn fail_attempt(
    mgr: &mut StateManager<'_>,
    task: &Task,
    attempt: u32,
    err: &TaskError,
    default_retry: RetryPolicy,
    now: Now,
) -> Result<Option<Instant>, StoreError> {
    let policy = task.effective_retry(default_retry);
    let message = err.to_string();

    if err.is_retryable() && policy.allows_retry_after(attempt) {
        let delay = policy.delay_after(attempt);
        warn!(task = %task.id(), attempt, error = %err, ?delay, "attempt failed; retrying");
        let retried = mgr.apply_with(task.id(), TaskStatus::Ready, now.wall, |r| {
            r.last_error = Some(message)
        })?;
        return Ok(retried.then_some(now.instant + delay));
    }

    warn!(task = %task.id(), attempt, error = %err, "task failed");
    mgr.apply_with(task.id(), TaskStatus::Failed, now.wall, |r| {
        r.last_error = Some(message)
    })?;
    Ok(None)
}

/// Tasks a rerun resets, or why it is refused.
fn rerun_targets(
    flow: &Flow,
    run: &Run,
    task: &TaskId,
    mode: RerunMode,
) -> Result<BTreeSet<TaskId>, ControlError> {
    if !flow.graph().contains(task) || run.record(task).is_none() {
        return Err(ControlError::UnknownTask {
            flow: run.id().flow.clone(),
            task: task.clone(),
        });
    }

    let mut targets = BTreeSet::from([task.clone()]);
    if mode == RerunMode::Downstream {
        targets.extend(flow.graph().downstream_of(task));
    }
    targets.retain(|t| run.record(t).is_some());

    let running = targets
        .iter()
        .find(|t| run.record(t).is_some_and(|r| r.status == TaskStatus::Running));
    if let Some(running) = running {
        return Err(ControlError::InvalidTransition {
            task: running.clone(),
            status: TaskStatus::Running,
            action: "rerun",
        });
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::SkipReason;
    use crate::errors::GraphError;
    use crate::store::MemoryStateStore;
    use crate::task::{Noop, StoreMarker};

    fn task(id: &str, deps: &[&str]) -> crate::task::TaskBuilder {
        Task::builder(id, Arc::new(Noop)).requires(deps.iter().copied())
    }

    /// A (no deps), B (requires A), C (requires A).
    fn fan_out(retries_a: u32) -> Flow {
        let mut flow = Flow::create("f", None);
        flow.add_task(task("a", &[]).retries(retries_a).build()).unwrap();
        flow.add_task(task("b", &["a"]).build()).unwrap();
        flow.add_task(task("c", &["a"]).build()).unwrap();
        flow
    }

    fn core_with(flow: Flow, config: SchedulerConfig) -> (SchedulerCore, Arc<MemoryStateStore>, Now) {
        let store = Arc::new(MemoryStateStore::new());
        let mut core = SchedulerCore::new(config, store.clone());
        let now = Now::current();
        core.register_flow(flow, now).unwrap();
        (core, store, now)
    }

    fn control(core: &mut SchedulerCore, command: ControlCommand, now: Now) -> (CoreStep, ControlResult) {
        let mut step = core.step(CoreInput::Control(command), now).unwrap();
        let reply = step.reply.take().expect("control commands always reply");
        (step, reply)
    }

    fn trigger(core: &mut SchedulerCore, now: Now) -> (RunId, CoreStep) {
        let (step, reply) = control(core, ControlCommand::TriggerRun { flow: "f".into() }, now);
        match reply {
            Ok(ControlReply::RunStarted(run)) => (run, step),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    fn dispatched(step: &CoreStep) -> Vec<(String, u64, u32)> {
        step.commands
            .iter()
            .filter_map(|c| match c {
                CoreCommand::Dispatch(tasks) => Some(tasks),
                _ => None,
            })
            .flatten()
            .map(|t| (t.task.id().to_string(), t.ticket, t.attempt))
            .collect()
    }

    fn ticket_of(step: &CoreStep, task: &str) -> u64 {
        dispatched(step)
            .into_iter()
            .find(|(name, _, _)| name == task)
            .map(|(_, ticket, _)| ticket)
            .unwrap_or_else(|| panic!("{task} was not dispatched"))
    }

    fn finish(core: &mut SchedulerCore, run: &RunId, task: &str, ticket: u64, outcome: Result<(), TaskError>, now: Now) -> CoreStep {
        core.step(
            CoreInput::TaskFinished {
                run: run.clone(),
                task: TaskId::from(task),
                ticket,
                outcome,
            },
            now,
        )
        .unwrap()
    }

    fn status(core: &SchedulerCore, store: &MemoryStateStore, run: &RunId, task: &str) -> TaskStatus {
        core.run(run)
            .map(|r| r.records.clone())
            .or_else(|| store.get_run(run).unwrap().map(|r| r.records))
            .and_then(|records| records.get(&TaskId::from(task)).map(|r| r.status))
            .unwrap()
    }

    fn finished_status(step: &CoreStep) -> Option<RunStatus> {
        step.events.iter().find_map(|e| match e {
            SchedulerEvent::RunFinished { status, .. } => Some(*status),
            _ => None,
        })
    }

    #[test]
    fn fan_out_failure_does_not_stop_sibling() {
        let (mut core, store, now) = core_with(fan_out(0), SchedulerConfig::default());
        let (run, step) = trigger(&mut core, now);

        assert_eq!(dispatched(&step).len(), 1);
        assert_eq!(status(&core, &store, &run, "a"), TaskStatus::Running);
        assert_eq!(status(&core, &store, &run, "b"), TaskStatus::Blocked);
        assert_eq!(status(&core, &store, &run, "c"), TaskStatus::Blocked);

        let step = finish(&mut core, &run, "a", ticket_of(&step, "a"), Ok(()), now);
        let b = ticket_of(&step, "b");
        let c = ticket_of(&step, "c");

        finish(&mut core, &run, "b", b, Err(TaskError::fatal("boom")), now);
        assert_eq!(status(&core, &store, &run, "b"), TaskStatus::Failed);
        assert_eq!(status(&core, &store, &run, "c"), TaskStatus::Running);

        let step = finish(&mut core, &run, "c", c, Ok(()), now);
        assert_eq!(status(&core, &store, &run, "c"), TaskStatus::Succeeded);
        assert_eq!(finished_status(&step), Some(RunStatus::Failed));
        assert_eq!(store.get_run(&run).unwrap().unwrap().summary.status, RunStatus::Failed);
    }

    #[test]
    fn exhausted_retry_skips_dependents() {
        let (mut core, store, now) = core_with(fan_out(1), SchedulerConfig::default());
        let (run, step) = trigger(&mut core, now);

        let step = finish(&mut core, &run, "a", ticket_of(&step, "a"), Err(TaskError::failed("flaky")), now);
        let retry = dispatched(&step);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].2, 2, "second attempt");

        let step = finish(&mut core, &run, "a", retry[0].1, Err(TaskError::failed("flaky")), now);
        assert_eq!(status(&core, &store, &run, "a"), TaskStatus::Failed);
        for t in ["b", "c"] {
            let record = store.get_run(&run).unwrap().unwrap().records[&TaskId::from(t)].clone();
            assert_eq!(record.status, TaskStatus::Skipped);
            assert_eq!(record.skip_reason, Some(SkipReason::UpstreamFailed));
        }
        assert_eq!(finished_status(&step), Some(RunStatus::Failed));
    }

    #[test]
    fn satisfied_outputs_skip_without_dispatch() {
        let mut flow = Flow::create("f", None);
        flow.add_task(task("a", &[]).output(StoreMarker::new("a/done")).build())
            .unwrap();
        flow.add_task(task("b", &["a"]).build()).unwrap();
        let (mut core, store, now) = core_with(flow, SchedulerConfig::default());
        store.put_marker("a/done").unwrap();

        let (run, step) = trigger(&mut core, now);
        let names: Vec<String> = dispatched(&step).into_iter().map(|(n, _, _)| n).collect();
        assert_eq!(names, vec!["b".to_string()]);

        let a = core.run(&run).unwrap().records[&TaskId::from("a")].clone();
        assert_eq!(a.status, TaskStatus::Skipped);
        assert_eq!(a.skip_reason, Some(SkipReason::Satisfied));
    }

    #[test]
    fn stale_ticket_is_discarded() {
        let (mut core, store, now) = core_with(fan_out(0), SchedulerConfig::default());
        let (run, step) = trigger(&mut core, now);
        let ticket = ticket_of(&step, "a");

        let step = finish(&mut core, &run, "a", ticket + 100, Ok(()), now);
        assert!(dispatched(&step).is_empty());
        assert_eq!(status(&core, &store, &run, "a"), TaskStatus::Running);
    }

    #[test]
    fn global_limit_caps_dispatch() {
        let mut flow = Flow::create("f", None);
        for t in ["a", "b", "c"] {
            flow.add_task(task(t, &[]).build()).unwrap();
        }
        let (mut core, _store, now) = core_with(flow, SchedulerConfig::default().with_max_concurrent(2));
        let (run, step) = trigger(&mut core, now);

        let first = dispatched(&step);
        assert_eq!(first.len(), 2);
        assert_eq!(core.queued(), 1);

        let step = finish(&mut core, &run, &first[0].0, first[0].1, Ok(()), now);
        assert_eq!(dispatched(&step).len(), 1);
    }

    #[test]
    fn pause_holds_dispatch_until_resume() {
        let (mut core, _store, now) = core_with(fan_out(0), SchedulerConfig::default());
        control(&mut core, ControlCommand::Pause { flow: "f".into() }, now);

        let (_run, step) = trigger(&mut core, now);
        assert!(dispatched(&step).is_empty());
        assert!(core.is_paused("f"));

        let (step, reply) = control(&mut core, ControlCommand::Resume { flow: "f".into() }, now);
        assert_eq!(reply, Ok(ControlReply::Ack));
        assert_eq!(dispatched(&step).len(), 1);
    }

    #[test]
    fn silent_worker_times_out_on_tick() {
        let mut flow = Flow::create("f", None);
        flow.add_task(task("a", &[]).timeout(Duration::from_secs(1)).build())
            .unwrap();
        let config = SchedulerConfig::default().with_timeout_grace(Duration::from_secs(1));
        let (mut core, store, now) = core_with(flow, config);
        let (run, step) = trigger(&mut core, now);
        let ticket = ticket_of(&step, "a");

        let early = core.step(CoreInput::Tick, now.advance(Duration::from_millis(1500))).unwrap();
        assert!(early.commands.is_empty());

        let late = core.step(CoreInput::Tick, now.advance(Duration::from_secs(3))).unwrap();
        assert!(matches!(
            late.commands.as_slice(),
            [CoreCommand::Abort { ticket: t, .. }] if *t == ticket
        ));
        let record = store.get_run(&run).unwrap().unwrap().records[&TaskId::from("a")].clone();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.last_error.unwrap().contains("maximum run duration"));

        // The late result is discarded.
        finish(&mut core, &run, "a", ticket, Ok(()), now.advance(Duration::from_secs(4)));
        assert_eq!(status(&core, &store, &run, "a"), TaskStatus::Failed);
    }

    #[test]
    fn cancel_run_aborts_and_finishes_cancelled() {
        let (mut core, store, now) = core_with(fan_out(0), SchedulerConfig::default());
        let (run, step) = trigger(&mut core, now);
        let ticket = ticket_of(&step, "a");

        let (step, reply) = control(&mut core, ControlCommand::CancelRun { run: run.clone() }, now);
        assert_eq!(reply, Ok(ControlReply::Ack));
        assert!(step
            .commands
            .iter()
            .any(|c| matches!(c, CoreCommand::Abort { ticket: t, .. } if *t == ticket)));
        assert_eq!(finished_status(&step), Some(RunStatus::Cancelled));
        assert_eq!(core.in_flight(), 0);

        let stored = store.get_run(&run).unwrap().unwrap();
        assert!(stored.records.values().all(|r| r.status == TaskStatus::Cancelled));

        let (_, reply) = control(&mut core, ControlCommand::CancelRun { run: run.clone() }, now);
        assert_eq!(reply, Err(ControlError::RunFinished(run)));
    }

    #[test]
    fn rerun_of_running_task_is_rejected_without_change() {
        let (mut core, store, now) = core_with(fan_out(0), SchedulerConfig::default());
        let (run, _step) = trigger(&mut core, now);

        let (_, reply) = control(
            &mut core,
            ControlCommand::Rerun {
                run: run.clone(),
                task: "a".into(),
                mode: RerunMode::Single,
            },
            now,
        );
        assert!(matches!(reply, Err(ControlError::InvalidTransition { .. })));
        assert_eq!(status(&core, &store, &run, "a"), TaskStatus::Running);
    }

    #[test]
    fn rerun_single_reopens_finished_run() {
        let (mut core, store, now) = core_with(fan_out(0), SchedulerConfig::default());
        let (run, step) = trigger(&mut core, now);
        let step = finish(&mut core, &run, "a", ticket_of(&step, "a"), Ok(()), now);
        let (b, c) = (ticket_of(&step, "b"), ticket_of(&step, "c"));
        finish(&mut core, &run, "b", b, Ok(()), now);
        finish(&mut core, &run, "c", c, Ok(()), now);
        assert!(core.run(&run).is_none(), "run finished");

        let (step, reply) = control(
            &mut core,
            ControlCommand::Rerun {
                run: run.clone(),
                task: "b".into(),
                mode: RerunMode::Single,
            },
            now,
        );
        assert_eq!(reply, Ok(ControlReply::Ack));
        let names: Vec<String> = dispatched(&step).into_iter().map(|(n, _, _)| n).collect();
        assert_eq!(names, vec!["b".to_string()]);
        assert_eq!(status(&core, &store, &run, "a"), TaskStatus::Succeeded);
        assert_eq!(status(&core, &store, &run, "c"), TaskStatus::Succeeded);
        assert_eq!(
            store.get_run(&run).unwrap().unwrap().summary.status,
            RunStatus::Running
        );
    }

    #[test]
    fn recovery_treats_running_records_as_lost() {
        let store = Arc::new(MemoryStateStore::new());
        let now = Now::current();
        let run = {
            let mut core = SchedulerCore::new(SchedulerConfig::default(), store.clone());
            core.register_flow(fan_out(1), now).unwrap();
            let (run, step) = trigger(&mut core, now);
            assert_eq!(dispatched(&step).len(), 1);
            run
        };

        let mut core = SchedulerCore::new(SchedulerConfig::default(), store.clone());
        core.register_flow(fan_out(1), now).unwrap();
        let a = core.run(&run).unwrap().records[&TaskId::from("a")].clone();
        assert_eq!(a.status, TaskStatus::Ready);
        assert_eq!(a.attempt, 2);
        assert!(a.last_error.unwrap().contains("scheduler restarted"));

        let step = core.step(CoreInput::Tick, now).unwrap();
        assert_eq!(dispatched(&step), vec![("a".to_string(), 1, 2)]);

        let (next, _) = trigger(&mut core, now);
        assert_eq!(next.seq, run.seq + 1);
    }

    #[test]
    fn invalid_flow_sent_at_runtime_is_rejected_not_fatal() {
        let (mut core, _store, now) = core_with(fan_out(0), SchedulerConfig::default());

        let mut broken = Flow::create("broken", None);
        broken.add_task(task("a", &["ghost"]).build()).unwrap();
        let (_, reply) = control(&mut core, ControlCommand::RegisterFlow { flow: Box::new(broken) }, now);

        let err = reply.unwrap_err();
        assert_eq!(err.code(), "invalid_graph");
        assert!(matches!(
            err,
            ControlError::InvalidGraph { source: GraphError::DanglingDependency { .. }, .. }
        ));
        assert!(core.keep_running());

        let (_, step) = trigger(&mut core, now);
        assert_eq!(dispatched(&step).len(), 1);
    }

    /// Memory store whose marker lookups fail.
    #[derive(Debug, Default)]
    struct MarkerlessStore(MemoryStateStore);

    impl StateStore for MarkerlessStore {
        fn put_run(&self, run: &crate::run::RunSummary) -> Result<(), StoreError> {
            self.0.put_run(run)
        }
        fn put_record(&self, run: &RunId, task: &TaskId, record: &RunRecord) -> Result<(), StoreError> {
            self.0.put_record(run, task, record)
        }
        fn get_run(&self, run: &RunId) -> Result<Option<Run>, StoreError> {
            self.0.get_run(run)
        }
        fn records(&self, run: &RunId) -> Result<Vec<(TaskId, RunRecord)>, StoreError> {
            self.0.records(run)
        }
        fn runs_for_flow(&self, flow: &str) -> Result<Vec<crate::run::RunSummary>, StoreError> {
            self.0.runs_for_flow(flow)
        }
        fn has_marker(&self, _key: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("marker table offline".to_string()))
        }
        fn put_marker(&self, key: &str) -> Result<(), StoreError> {
            self.0.put_marker(key)
        }
    }

    #[test]
    fn failed_marker_lookup_is_fatal() {
        let mut flow = Flow::create("f", None);
        flow.add_task(task("a", &[]).output(StoreMarker::new("f/a")).build())
            .unwrap();
        let mut core = SchedulerCore::new(SchedulerConfig::default(), Arc::new(MarkerlessStore::default()));
        let now = Now::current();
        core.register_flow(flow, now).unwrap();

        let err = core
            .step(CoreInput::Control(ControlCommand::TriggerRun { flow: "f".into() }), now)
            .unwrap_err();
        assert!(matches!(err, DagflowError::Store(StoreError::Unavailable(_))), "{err:?}");
        assert_eq!(core.in_flight(), 0);
    }
}
