pub mod builders;
pub mod fake_executor;

use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

use dagflow::dag::RunRecord;
use dagflow::engine::SchedulerEvent;
use dagflow::errors::StoreError;
use dagflow::run::{Run, RunId, RunStatus, RunSummary};
use dagflow::store::{MemoryStateStore, StateStore};
use dagflow::task::TaskId;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

/// Wait for `RunFinished` of `run` on an event subscription.
pub async fn wait_for_run_finished(
    events: &mut broadcast::Receiver<SchedulerEvent>,
    run: &RunId,
) -> RunStatus {
    with_timeout(async {
        loop {
            match events.recv().await {
                Ok(SchedulerEvent::RunFinished { run: id, status }) if &id == run => return status,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
}

/// Memory store whose writes start failing once `break_writes` is called.
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryStateStore,
    broken: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn break_writes(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.broken.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("disk on fire".to_string()))
        } else {
            Ok(())
        }
    }
}

impl StateStore for FailingStore {
    fn put_run(&self, run: &RunSummary) -> Result<(), StoreError> {
        self.check()?;
        self.inner.put_run(run)
    }

    fn put_record(&self, run: &RunId, task: &TaskId, record: &RunRecord) -> Result<(), StoreError> {
        self.check()?;
        self.inner.put_record(run, task, record)
    }

    fn get_run(&self, run: &RunId) -> Result<Option<Run>, StoreError> {
        self.inner.get_run(run)
    }

    fn records(&self, run: &RunId) -> Result<Vec<(TaskId, RunRecord)>, StoreError> {
        self.inner.records(run)
    }

    fn runs_for_flow(&self, flow: &str) -> Result<Vec<RunSummary>, StoreError> {
        self.inner.runs_for_flow(flow)
    }

    fn has_marker(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.has_marker(key)
    }

    fn put_marker(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.put_marker(key)
    }
}
