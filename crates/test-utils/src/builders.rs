// crates/test-utils/src/builders.rs

use std::sync::Arc;
use std::time::Duration;

use dagflow::flow::{Flow, Recurrence};
use dagflow::task::{Noop, RetryPolicy, StoreMarker, Task, TaskBuilder};

/// Builder for `Flow` to simplify test setup.
///
/// Tasks default to the `Noop` behaviour; what an attempt actually does is
/// decided by the fake executor running it.
pub struct FlowBuilder {
    name: String,
    recurrence: Option<Recurrence>,
    max_concurrent: Option<usize>,
    tasks: Vec<TaskBuilder>,
}

impl FlowBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            recurrence: None,
            max_concurrent: None,
            tasks: Vec::new(),
        }
    }

    /// Add a task requiring `deps`.
    pub fn task(self, id: &str, deps: &[&str]) -> Self {
        self.with_task(TaskConfigBuilder::new(id).requires(deps))
    }

    pub fn with_task(mut self, task: TaskConfigBuilder) -> Self {
        self.tasks.push(task.inner);
        self
    }

    pub fn recurrence(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    pub fn max_concurrent(mut self, limit: usize) -> Self {
        self.max_concurrent = Some(limit);
        self
    }

    /// Build the flow without activating it.
    pub fn build(self) -> Flow {
        let mut flow = Flow::create(self.name, self.recurrence);
        if let Some(limit) = self.max_concurrent {
            flow = flow.with_max_concurrent(limit);
        }
        for task in self.tasks {
            flow.add_task(task.build()).expect("FlowBuilder: duplicate task id");
        }
        flow
    }
}

/// Builder for a single test task.
pub struct TaskConfigBuilder {
    inner: TaskBuilder,
}

impl TaskConfigBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            inner: Task::builder(id, Arc::new(Noop)),
        }
    }

    pub fn requires(mut self, deps: &[&str]) -> Self {
        self.inner = self.inner.requires(deps.iter().copied());
        self
    }

    pub fn retries(mut self, n: u32) -> Self {
        self.inner = self.inner.retries(n);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.inner = self.inner.retry(policy);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.inner = self.inner.timeout(timeout);
        self
    }

    pub fn executor(mut self, hint: &str) -> Self {
        self.inner = self.inner.executor_hint(hint);
        self
    }

    /// Completion tracked by a store marker named after `key`.
    pub fn marker(mut self, key: &str) -> Self {
        self.inner = self.inner.output(StoreMarker::new(key));
        self
    }

    pub fn build(self) -> Task {
        self.inner.build()
    }
}

/// A (no deps), B and C both requiring A.
pub fn fan_out(name: &str) -> FlowBuilder {
    FlowBuilder::new(name)
        .task("a", &[])
        .task("b", &["a"])
        .task("c", &["a"])
}

/// a -> b -> c
pub fn chain(name: &str) -> FlowBuilder {
    FlowBuilder::new(name)
        .task("a", &[])
        .task("b", &["a"])
        .task("c", &["b"])
}
