//! Core domain models for the dispatcher.
//!
//! This module contains the batch's task model, the dependency graph with its
//! readiness engine, plan phases, the concurrency gate, and the batch lifecycle.

pub mod dag;
pub mod gate;
pub mod lifecycle;
pub mod phase;
pub mod settings;
pub mod task;

pub use dag::TaskGraph;
pub use gate::ConcurrencyGate;
pub use lifecycle::{BatchLifecycle, BatchState, StateHistoryEntry};
pub use phase::{apply_phases, Phase};
pub use settings::{BatchSettings, FailurePolicy};
pub use task::{BatchId, Task, TaskId, TaskStatus};
