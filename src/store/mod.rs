// src/store/mod.rs

//! Durable home of run data.
//!
//! The scheduler is the only writer. It persists every record transition
//! through [`StateStore::put_record`] before the change becomes visible to
//! anyone else, so readers only ever observe committed states. Any error
//! returned here is fatal to the scheduler loop.

mod memory;

use std::fmt::Debug;

use crate::dag::RunRecord;
use crate::errors::StoreError;
use crate::run::{Run, RunId, RunSummary};
use crate::task::TaskId;

pub use memory::MemoryStateStore;

/// Storage backend for runs, task records and output markers.
///
/// Implementations must make `put_record` atomic per record. Calls are made
/// from the scheduler loop, so they should be quick.
pub trait StateStore: Send + Sync + Debug {
    /// Insert or update a row of the runs table.
    fn put_run(&self, run: &RunSummary) -> Result<(), StoreError>;

    /// Insert or update one task record of a run.
    fn put_record(&self, run: &RunId, task: &TaskId, record: &RunRecord) -> Result<(), StoreError>;

    /// Run row plus all its records, if the run is known.
    fn get_run(&self, run: &RunId) -> Result<Option<Run>, StoreError>;

    /// Point query for the records of one run.
    fn records(&self, run: &RunId) -> Result<Vec<(TaskId, RunRecord)>, StoreError>;

    /// Range query: every run of a flow, ordered by sequence.
    fn runs_for_flow(&self, flow: &str) -> Result<Vec<RunSummary>, StoreError>;

    fn has_marker(&self, key: &str) -> Result<bool, StoreError>;

    fn put_marker(&self, key: &str) -> Result<(), StoreError>;
}

/// Persist a whole run: the runs row first, then every record.
pub fn put_full_run(store: &dyn StateStore, run: &Run) -> Result<(), StoreError> {
    store.put_run(&run.summary)?;
    for (task, record) in &run.records {
        store.put_record(&run.summary.id, task, record)?;
    }
    Ok(())
}
