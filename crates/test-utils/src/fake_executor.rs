// crates/test-utils/src/fake_executor.rs

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dagflow::errors::TaskError;
use dagflow::exec::Executor;
use dagflow::task::{Task, TaskContext, TaskFuture};

/// What one attempt of a task does.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(TaskError),
    /// Sleep, then succeed.
    Sleep(Duration),
    /// Block until the attempt is cancelled.
    Hang,
}

#[derive(Debug, Default)]
struct State {
    scripts: HashMap<String, VecDeque<Step>>,
    executed: Vec<(String, u32)>,
    cancelled: Vec<String>,
    running: usize,
    max_running: usize,
}

/// A fake executor that:
/// - records which attempts were started,
/// - plays back a per-task script of outcomes (default: succeed),
/// - tracks how many attempts ran at the same time.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExecutor {
    state: Arc<Mutex<State>>,
    non_preemptible: bool,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aborted attempts keep running; the scheduler must discard their result.
    pub fn non_preemptible(mut self) -> Self {
        self.non_preemptible = true;
        self
    }

    /// Queue outcomes for the next attempts of `task`.
    pub fn script(&self, task: &str, steps: impl IntoIterator<Item = Step>) -> &Self {
        self.lock()
            .scripts
            .entry(task.to_string())
            .or_default()
            .extend(steps);
        self
    }

    /// Started attempts as `(task, attempt)`, in start order.
    pub fn executed(&self) -> Vec<(String, u32)> {
        self.lock().executed.clone()
    }

    pub fn executed_tasks(&self) -> Vec<String> {
        self.executed().into_iter().map(|(task, _)| task).collect()
    }

    pub fn attempts_of(&self, task: &str) -> usize {
        self.lock().executed.iter().filter(|(t, _)| t == task).count()
    }

    /// Tasks whose hanging attempt observed cancellation.
    pub fn cancelled(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }

    pub fn max_running(&self) -> usize {
        self.lock().max_running
    }

    /// Wait until at least `n` attempts have started.
    pub async fn wait_for_starts(&self, n: usize) {
        while self.lock().executed.len() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Decrements the running count however the attempt ends.
struct RunningGuard(Arc<Mutex<State>>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut state = self.0.lock().unwrap_or_else(|p| p.into_inner());
        state.running -= 1;
    }
}

impl Executor for ScriptedExecutor {
    fn submit(&self, task: Arc<Task>, ctx: TaskContext) -> TaskFuture {
        let name = task.id().to_string();
        let step = {
            let mut state = self.lock();
            state.executed.push((name.clone(), ctx.attempt));
            state.running += 1;
            state.max_running = state.max_running.max(state.running);
            state
                .scripts
                .get_mut(&name)
                .and_then(|q| q.pop_front())
                .unwrap_or(Step::Succeed)
        };
        let guard = RunningGuard(Arc::clone(&self.state));
        let state = Arc::clone(&self.state);

        Box::pin(async move {
            let _guard = guard;
            match step {
                Step::Succeed => Ok(()),
                Step::Fail(err) => Err(err),
                Step::Sleep(d) => {
                    tokio::time::sleep(d).await;
                    Ok(())
                }
                Step::Hang => {
                    ctx.cancellation().cancelled().await;
                    state
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .cancelled
                        .push(name);
                    Err(TaskError::fatal("cancelled"))
                }
            }
        })
    }

    fn supports_preemption(&self) -> bool {
        !self.non_preemptible
    }
}
