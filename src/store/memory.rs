// src/store/memory.rs

use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use crate::dag::RunRecord;
use crate::errors::StoreError;
use crate::run::{Run, RunId, RunSummary};
use crate::store::StateStore;
use crate::task::TaskId;

#[derive(Debug, Default)]
struct Tables {
    runs: BTreeMap<RunId, RunSummary>,
    records: BTreeMap<RunId, BTreeMap<TaskId, RunRecord>>,
    markers: HashSet<String>,
}

/// In-process store. Nothing survives the process, but a single instance
/// shared between scheduler restarts is enough to exercise recovery.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    tables: RwLock<Tables>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl StateStore for MemoryStateStore {
    fn put_run(&self, run: &RunSummary) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        tables.runs.insert(run.id.clone(), run.clone());
        tables.records.entry(run.id.clone()).or_default();
        Ok(())
    }

    fn put_record(&self, run: &RunId, task: &TaskId, record: &RunRecord) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        if !tables.runs.contains_key(run) {
            return Err(StoreError::Corrupt(format!(
                "record for task '{task}' written before run '{run}'"
            )));
        }
        tables
            .records
            .entry(run.clone())
            .or_default()
            .insert(task.clone(), record.clone());
        Ok(())
    }

    fn get_run(&self, run: &RunId) -> Result<Option<Run>, StoreError> {
        let tables = self.read()?;
        Ok(tables.runs.get(run).map(|summary| Run {
            summary: summary.clone(),
            records: tables.records.get(run).cloned().unwrap_or_default(),
        }))
    }

    fn records(&self, run: &RunId) -> Result<Vec<(TaskId, RunRecord)>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .records
            .get(run)
            .map(|records| {
                records
                    .iter()
                    .map(|(id, record)| (id.clone(), record.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn runs_for_flow(&self, flow: &str) -> Result<Vec<RunSummary>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .runs
            .values()
            .filter(|summary| summary.id.flow == flow)
            .cloned()
            .collect())
    }

    fn has_marker(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.read()?.markers.contains(key))
    }

    fn put_marker(&self, key: &str) -> Result<(), StoreError> {
        self.write()?.markers.insert(key.to_string());
        Ok(())
    }
}
