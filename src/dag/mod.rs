// src/dag/mod.rs

//! Dependency graph and per-run task state.
//!
//! - [`graph`] holds the acyclic requirement graph of one flow and the pure
//!   readiness queries over a record snapshot.
//! - [`record`] defines task statuses, run records and the state machine.
//! - [`state_manager`] applies state-machine transitions to a run, persisting
//!   each one to the state store.

pub mod graph;
pub mod record;
pub mod state_manager;

pub use graph::{DagGraph, RecordSnapshot};
pub use record::{InvalidTransition, RunRecord, SkipReason, TaskStatus};
pub use state_manager::{StateManager, Transition};
