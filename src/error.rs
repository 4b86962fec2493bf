use thiserror::Error;

use crate::core::task::{BatchId, TaskId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Dependency cycle detected: {remaining} tasks could not be ordered (at {task})")]
    Cycle { task: TaskId, remaining: usize },

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Duplicate phase id: {0}")]
    DuplicatePhase(String),

    #[error("Phase {phase} depends on unknown phase {dependency}")]
    UnknownPhaseDependency { phase: String, dependency: String },

    #[error("Phase dependency cycle detected (at {0})")]
    PhaseCycle(String),

    #[error("Task {task} belongs to unknown phase {phase}")]
    UnknownPhase { task: TaskId, phase: String },

    #[error("Invalid plan slug: {0:?}")]
    InvalidSlug(String),

    #[error("No tasks found for plan {0}")]
    NoTasks(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("Batch already exists: {0}")]
    BatchExists(BatchId),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invalid batch state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Dispatcher is shutting down")]
    Shutdown,
}

impl Error {
    /// Whether the error aborts a batch before any dispatch occurs.
    pub fn is_pre_dispatch(&self) -> bool {
        matches!(
            self,
            Error::Cycle { .. }
                | Error::UnknownDependency { .. }
                | Error::DuplicateTask(_)
                | Error::DuplicatePhase(_)
                | Error::UnknownPhaseDependency { .. }
                | Error::PhaseCycle(_)
                | Error::UnknownPhase { .. }
                | Error::InvalidSlug(_)
                | Error::NoTasks(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
