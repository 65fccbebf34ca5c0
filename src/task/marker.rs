// src/task/marker.rs

//! Output markers: idempotency signals proving a task already produced its
//! result, so a fresh run can skip it without touching the executor.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::StoreError;
use crate::fs::{FileSystem, RealFileSystem};
use crate::store::StateStore;

pub trait OutputMarker: Send + Sync + fmt::Debug {
    /// Whether the artifact/signal is present. A store that cannot answer
    /// is an error, never "absent".
    fn exists(&self, store: &dyn StateStore) -> Result<bool, StoreError>;

    /// Called by the scheduler once the owning task SUCCEEDED.
    ///
    /// Markers whose artifact is produced by the task itself keep the default.
    fn commit(&self, _store: &dyn StateStore) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A file the task is expected to write.
#[derive(Debug, Clone)]
pub struct FileMarker {
    path: PathBuf,
    fs: Arc<dyn FileSystem>,
}

impl FileMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_fs(path, Arc::new(RealFileSystem))
    }

    pub fn with_fs(path: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            path: path.into(),
            fs,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OutputMarker for FileMarker {
    fn exists(&self, _store: &dyn StateStore) -> Result<bool, StoreError> {
        Ok(self.fs.is_file(&self.path))
    }
}

/// A key recorded in the state store when the task succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMarker {
    key: String,
}

impl StoreMarker {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl OutputMarker for StoreMarker {
    fn exists(&self, store: &dyn StateStore) -> Result<bool, StoreError> {
        store.has_marker(&self.key)
    }

    fn commit(&self, store: &dyn StateStore) -> Result<(), StoreError> {
        store.put_marker(&self.key)
    }
}
