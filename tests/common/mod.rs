// tests/common/mod.rs

#![allow(dead_code)]

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use dagflow::config::SchedulerConfig;
use dagflow::engine::{Scheduler, SchedulerEvent, SchedulerHandle};
use dagflow::errors::Result;
use dagflow::flow::Flow;
use dagflow::store::{MemoryStateStore, StateStore};
use dagflow_test_utils::fake_executor::ScriptedExecutor;

pub use dagflow_test_utils::{init_tracing, wait_for_run_finished, with_timeout};

/// A running scheduler plus what tests need to poke at it.
pub struct Harness {
    pub handle: SchedulerHandle,
    pub events: broadcast::Receiver<SchedulerEvent>,
    pub join: JoinHandle<Result<()>>,
    pub store: Arc<dyn StateStore>,
}

pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig::default().with_tick_interval(std::time::Duration::from_millis(10))
}

pub fn start(flow: Flow, executor: &ScriptedExecutor) -> Harness {
    start_with(flow, executor, fast_config(), Arc::new(MemoryStateStore::new()))
}

pub fn start_with(
    flow: Flow,
    executor: &ScriptedExecutor,
    config: SchedulerConfig,
    store: Arc<dyn StateStore>,
) -> Harness {
    init_tracing();
    let mut scheduler = Scheduler::new(config, Arc::clone(&store), Arc::new(executor.clone()));
    scheduler.register_flow(flow).expect("flow registers");
    let events = scheduler.subscribe();
    let (handle, join) = scheduler.spawn();
    Harness {
        handle,
        events,
        join,
        store,
    }
}

impl Harness {
    pub async fn stop(self) {
        self.handle.shutdown(true).await.expect("shutdown accepted");
        with_timeout(self.join)
            .await
            .expect("scheduler task joins")
            .expect("scheduler exits cleanly");
    }
}
