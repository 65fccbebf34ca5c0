// src/engine/runtime.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::SchedulerConfig;
use crate::errors::{Result, TaskError};
use crate::exec::{Executor, ExecutorRegistry};
use crate::flow::Flow;
use crate::store::StateStore;
use crate::task::TaskContext;

use super::control::{ControlResult, SchedulerHandle};
use super::core::{CoreCommand, CoreInput, CoreStep, Now, ScheduledTask, SchedulerCore};
use super::events::SchedulerEvent;
use super::RuntimeEvent;

/// A dispatched attempt the shell is waiting on.
struct RunningJob {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    preemptible: bool,
}

/// Drives [`SchedulerCore`] from the event channel and a periodic tick, and
/// carries out its commands against the executors.
///
/// All semantics live in the core; this struct only does async IO:
/// receiving control commands and task results, spawning attempts, and
/// publishing events.
pub struct Scheduler {
    core: SchedulerCore,
    executors: ExecutorRegistry,
    event_tx: mpsc::Sender<RuntimeEvent>,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    events: broadcast::Sender<SchedulerEvent>,
    jobs: HashMap<u64, RunningJob>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("core", &self.core)
            .field("executors", &self.executors)
            .field("jobs", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, store: Arc<dyn StateStore>, executor: Arc<dyn Executor>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            core: SchedulerCore::new(config, store),
            executors: ExecutorRegistry::new(executor),
            event_tx,
            event_rx,
            events,
            jobs: HashMap::new(),
        }
    }

    /// Make `executor` available to tasks whose hint is `name`.
    pub fn with_executor(mut self, name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        self.executors.register(name, executor);
        self
    }

    /// Register a flow before the loop starts. Unfinished runs of the flow
    /// found in the store are resumed.
    pub fn register_flow(&mut self, flow: Flow) -> Result<()> {
        let events = self.core.register_flow(flow, Now::current())?;
        self.publish(events);
        Ok(())
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle::new(self.event_tx.clone(), self.events.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Run the loop on a Tokio task.
    pub fn spawn(self) -> (SchedulerHandle, JoinHandle<Result<()>>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    /// Main event loop.
    ///
    /// Returns after a shutdown command once the core allows it, or with the
    /// first fatal error (a failing state store). Either way every attempt
    /// still running is aborted.
    pub async fn run(mut self) -> Result<()> {
        let config = *self.core.config();
        info!(
            max_concurrent = config.max_concurrent,
            tick = ?config.tick_interval,
            "scheduler started"
        );

        let mut interval = tokio::time::interval(config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wakeup = self.core.next_wakeup(std::time::Instant::now());
            let (input, reply) = tokio::select! {
                event = self.event_rx.recv() => match event {
                    Some(event) => self.accept(event),
                    None => {
                        info!("scheduler event channel closed; exiting");
                        break;
                    }
                },
                _ = interval.tick() => (CoreInput::Tick, None),
                _ = backoff_elapsed(wakeup) => (CoreInput::Tick, None),
            };

            let step = match self.core.step(input, Now::current()) {
                Ok(step) => step,
                Err(err) => {
                    error!(error = %err, "scheduler stopped on fatal error");
                    self.abort_all();
                    return Err(err);
                }
            };

            let keep_running = self.apply(step, reply);
            if !keep_running {
                info!("core requested exit; stopping scheduler");
                break;
            }
        }

        self.abort_all();
        info!("scheduler exiting");
        Ok(())
    }

    fn accept(&mut self, event: RuntimeEvent) -> (CoreInput, Option<oneshot::Sender<ControlResult>>) {
        match event {
            RuntimeEvent::Control { command, reply } => {
                debug!(?command, "control command received");
                (CoreInput::Control(command), Some(reply))
            }
            RuntimeEvent::TaskFinished {
                run,
                task,
                ticket,
                outcome,
            } => {
                self.jobs.remove(&ticket);
                (
                    CoreInput::TaskFinished {
                        run,
                        task,
                        ticket,
                        outcome,
                    },
                    None,
                )
            }
        }
    }

    fn apply(&mut self, step: CoreStep, reply: Option<oneshot::Sender<ControlResult>>) -> bool {
        for command in step.commands {
            match command {
                CoreCommand::Dispatch(tasks) => {
                    for task in tasks {
                        self.dispatch(task);
                    }
                }
                CoreCommand::Abort { run, task, ticket } => {
                    debug!(run = %run, task = %task, ticket, "aborting attempt");
                    self.abort(ticket);
                }
            }
        }

        self.publish(step.events);

        if let (Some(reply), Some(result)) = (reply, step.reply) {
            if reply.send(result).is_err() {
                debug!("control caller went away before the reply");
            }
        }
        step.keep_running
    }

    fn dispatch(&mut self, scheduled: ScheduledTask) {
        let executor = Arc::clone(self.executors.select(scheduled.task.executor_hint()));
        let cancel = CancellationToken::new();
        let ctx = TaskContext::new(
            scheduled.run.clone(),
            scheduled.task.id().clone(),
            scheduled.attempt,
            scheduled.task.params().clone(),
            cancel.clone(),
        );
        let attempt = executor.submit(Arc::clone(&scheduled.task), ctx);

        let tx = self.event_tx.clone();
        let ScheduledTask {
            run,
            task,
            ticket,
            timeout,
            ..
        } = scheduled;
        let task = task.id().clone();

        let handle = tokio::spawn(async move {
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(TaskError::Timeout(limit)),
                },
                None => attempt.await,
            };
            let finished = RuntimeEvent::TaskFinished {
                run,
                task,
                ticket,
                outcome,
            };
            if tx.send(finished).await.is_err() {
                debug!(ticket, "scheduler gone; dropping task result");
            }
        });

        self.jobs.insert(
            ticket,
            RunningJob {
                cancel,
                handle,
                preemptible: executor.supports_preemption(),
            },
        );
    }

    fn abort(&mut self, ticket: u64) {
        let Some(job) = self.jobs.remove(&ticket) else {
            return;
        };
        job.cancel.cancel();
        if job.preemptible {
            job.handle.abort();
        } else {
            debug!(ticket, "executor cannot preempt; its late result will be discarded");
        }
    }

    fn abort_all(&mut self) {
        let tickets: Vec<u64> = self.jobs.keys().copied().collect();
        for ticket in tickets {
            self.abort(ticket);
        }
    }

    fn publish(&self, events: Vec<SchedulerEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

/// Resolves when a retry backoff expires; never, when none is pending.
async fn backoff_elapsed(at: Option<std::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
