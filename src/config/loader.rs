// src/config/loader.rs

use std::path::{Path, PathBuf};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{DagflowError, Result};
use crate::fs::{FileSystem, RealFileSystem};

/// Load a configuration file and return the raw, unvalidated model.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    load_with_fs(&RealFileSystem, path)
}

/// Like [`load_from_path`], reading through the given filesystem.
pub fn load_with_fs(fs: &dyn FileSystem, path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs.read_to_string(path).map_err(DagflowError::Other)?;
    let config: RawConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// Load a configuration file and validate it.
///
/// A missing file at the default location is not an error: the built-in
/// defaults apply. An explicitly named file must exist.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    let raw = if path == default_config_path() && !RealFileSystem.is_file(path) {
        RawConfigFile::default()
    } else {
        load_from_path(path)?
    };
    ConfigFile::try_from(raw)
}

/// `Dagflow.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Dagflow.toml")
}
