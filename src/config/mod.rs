// src/config/mod.rs

//! Scheduler configuration.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate and convert the raw model into typed settings (`validate.rs`).
//!
//! Flows and tasks are never defined here; they are built in code.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, load_with_fs};
pub use model::{
    parse_duration, ConfigFile, DefaultsSection, RawConfigFile, RawDefaultsSection,
    RawSchedulerSection, SchedulerConfig, SchedulerSection,
};
