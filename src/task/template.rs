// src/task/template.rs

use std::fmt;
use std::sync::Arc;

use super::{Params, TaskBehavior, TaskBuilder, TaskId};

type BehaviorFactory = dyn Fn(&Params) -> Arc<dyn TaskBehavior> + Send + Sync;

/// A task family: one constructor producing parameterised instances.
///
/// Instances get content-derived ids, so instantiating the same template
/// with the same parameters twice yields the same identity (and a
/// `DuplicateIdentity` error if both are added to one flow).
#[derive(Clone)]
pub struct TaskTemplate {
    family: String,
    factory: Arc<BehaviorFactory>,
}

impl TaskTemplate {
    pub fn new<F>(family: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&Params) -> Arc<dyn TaskBehavior> + Send + Sync + 'static,
    {
        Self {
            family: family.into(),
            factory: Arc::new(factory),
        }
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    /// Start building an instance; requirements and policies are added on
    /// the returned builder.
    pub fn instantiate(&self, params: Params) -> TaskBuilder {
        let id = TaskId::derived(&self.family, &params);
        let behavior = (self.factory)(&params);
        TaskBuilder::new(id, behavior).params(params)
    }
}

impl fmt::Debug for TaskTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTemplate")
            .field("family", &self.family)
            .finish_non_exhaustive()
    }
}
