// src/task/mod.rs

//! Task definitions.
//!
//! A [`Task`] is an immutable configuration value: identity, parameters,
//! upstream requirements, retry/timeout policy, output markers and a
//! reference to its executable [`TaskBehavior`]. Once built it never
//! changes; everything mutable about a task lives in its per-run record.
//!
//! - [`id`] holds [`TaskId`] and content-derived identities.
//! - [`params`] holds the immutable parameter map.
//! - [`behavior`] defines the execution contract and closure adapter.
//! - [`marker`] defines output markers used for skip-on-rerun decisions.
//! - [`template`] produces parameterised instances of one task family.

pub mod behavior;
pub mod id;
pub mod marker;
pub mod params;
pub mod template;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::StoreError;
use crate::store::StateStore;

pub use behavior::{from_fn, Noop, TaskBehavior, TaskContext, TaskFuture};
pub use id::TaskId;
pub use marker::{FileMarker, OutputMarker, StoreMarker};
pub use params::Params;
pub use template::TaskTemplate;

/// Upper bound on the exponential backoff multiplier.
const MAX_BACKOFF_DOUBLINGS: u32 = 6;

/// How often a failed attempt may be retried, and how long to wait between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before the first retry; doubles for every further retry.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Duration::ZERO,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether the attempt that just failed (1-based) may be followed by another.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Delay before re-dispatching after the given failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(MAX_BACKOFF_DOUBLINGS);
        self.backoff.saturating_mul(1 << doublings)
    }
}

/// Immutable task definition.
#[derive(Debug, Clone)]
pub struct Task {
    id: TaskId,
    params: Params,
    requires: BTreeSet<TaskId>,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
    executor_hint: Option<String>,
    outputs: Vec<Arc<dyn OutputMarker>>,
    behavior: Arc<dyn TaskBehavior>,
}

impl Task {
    /// Declare a task from its identity, parameters and requirements.
    pub fn declare<I, T>(
        id: impl Into<TaskId>,
        params: Params,
        requires: I,
        behavior: Arc<dyn TaskBehavior>,
    ) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        Self::builder(id, behavior)
            .params(params)
            .requires(requires)
            .build()
    }

    pub fn builder(id: impl Into<TaskId>, behavior: Arc<dyn TaskBehavior>) -> TaskBuilder {
        TaskBuilder::new(id.into(), behavior)
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn requires(&self) -> &BTreeSet<TaskId> {
        &self.requires
    }

    /// Retry policy declared on the task itself, if any.
    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry
    }

    /// Effective retry policy given the scheduler-wide default.
    pub fn effective_retry(&self, default: RetryPolicy) -> RetryPolicy {
        self.retry.unwrap_or(default)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Effective maximum run duration given the scheduler-wide default.
    pub fn effective_timeout(&self, default: Option<Duration>) -> Option<Duration> {
        self.timeout.or(default)
    }

    pub fn executor_hint(&self) -> Option<&str> {
        self.executor_hint.as_deref()
    }

    pub fn outputs(&self) -> &[Arc<dyn OutputMarker>] {
        &self.outputs
    }

    pub fn behavior(&self) -> &Arc<dyn TaskBehavior> {
        &self.behavior
    }

    /// Whether this task's work is already done.
    ///
    /// A behaviour override wins; otherwise the task is complete iff it has
    /// at least one output marker and every marker exists.
    pub fn is_complete(&self, store: &dyn StateStore) -> Result<bool, StoreError> {
        if let Some(done) = self.behavior.is_complete(store)? {
            return Ok(done);
        }
        if self.outputs.is_empty() {
            return Ok(false);
        }
        for marker in &self.outputs {
            if !marker.exists(store)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn execute(&self, ctx: TaskContext) -> TaskFuture {
        self.behavior.execute(ctx)
    }

    pub(crate) fn commit_outputs(&self, store: &dyn StateStore) -> Result<(), StoreError> {
        for marker in &self.outputs {
            marker.commit(store)?;
        }
        Ok(())
    }
}

/// Builder for [`Task`]; the only way to set optional fields.
#[derive(Debug)]
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(id: TaskId, behavior: Arc<dyn TaskBehavior>) -> Self {
        Self {
            task: Task {
                id,
                params: Params::new(),
                requires: BTreeSet::new(),
                retry: None,
                timeout: None,
                executor_hint: None,
                outputs: Vec::new(),
                behavior,
            },
        }
    }

    pub fn params(mut self, params: Params) -> Self {
        self.task.params = params;
        self
    }

    pub fn require(mut self, dep: impl Into<TaskId>) -> Self {
        self.task.requires.insert(dep.into());
        self
    }

    pub fn requires<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.task.requires.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Require another task instance.
    pub fn requires_task(self, upstream: &Task) -> Self {
        self.require(upstream.id().clone())
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.task.retry = Some(policy);
        self
    }

    pub fn retries(self, max_retries: u32) -> Self {
        self.retry(RetryPolicy::retries(max_retries))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.task.timeout = Some(timeout);
        self
    }

    pub fn executor_hint(mut self, hint: impl Into<String>) -> Self {
        self.task.executor_hint = Some(hint.into());
        self
    }

    pub fn output(mut self, marker: impl OutputMarker + 'static) -> Self {
        self.task.outputs.push(Arc::new(marker));
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}
