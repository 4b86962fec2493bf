//! Task data model for the dispatch graph.
//!
//! Tasks are the atomic units of work in a batch. Each task tracks its
//! dependencies, its scheduling status, and the timestamps the dispatcher
//! needs for ordering guarantees and result accounting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier for a task within a batch.
///
/// Task ids come from the plan's persisted task list (for example
/// `task.auth-refactor.3`) and are stable for the lifetime of the batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier correlating every message of one dispatch run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl BatchId {
    /// Generate a fresh batch identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BatchId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BatchId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task status in its lifecycle.
///
/// Tasks move forward only: `Pending -> ContextBuilding -> Dispatched ->
/// Completed | Failed`. A `Pending` or in-flight task may also jump straight
/// to `Failed` when an upstream dependency fails or the batch is cancelled.
/// An unapproved task goes from `Pending` to `Skipped` when it becomes ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting for dependencies or for a concurrency slot.
    Pending,
    /// Context build requested; counts against `max_concurrent`.
    ContextBuilding,
    /// Execution trigger published; counts against `max_concurrent`.
    Dispatched,
    /// Executor reported success.
    Completed,
    /// Task failed, was skipped due to an upstream failure, or was cancelled.
    Failed {
        /// Why the task failed.
        reason: String,
    },
    /// Never dispatched because the plan did not approve it. Satisfies
    /// dependents like `Completed` but is counted as neither dispatched nor failed.
    Skipped {
        reason: String,
    },
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Short, stable name used in logs and phase updates.
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::ContextBuilding => "context_building",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Skipped { .. } => "skipped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { reason } => write!(f, "failed: {}", reason),
            TaskStatus::Skipped { reason } => write!(f, "skipped: {}", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// A single task in the dispatch graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Position in the plan's task list; the tie-break among ready tasks.
    #[serde(default)]
    pub sequence: usize,
    /// What the executor should accomplish.
    #[serde(default)]
    pub description: String,
    /// Tasks that must complete before this one may start.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Advisory list of files the task will touch.
    #[serde(default)]
    pub files: Vec<String>,
    /// Plan phase this task belongs to, if the plan is phased.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    /// Tasks of earlier phases that must reach a terminal state first.
    /// Unlike `depends_on`, a failure here does not propagate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<TaskId>,
    /// Whether the plan approved this task for execution.
    #[serde(default = "default_approved")]
    pub approved: bool,
    /// Current scheduling status.
    #[serde(default)]
    pub status: TaskStatus,
    /// When the execution trigger was first published.
    #[serde(default)]
    pub dispatched_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_approved() -> bool {
    true
}

impl Task {
    /// Create a pending task with no dependencies.
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            sequence: 0,
            description: String::new(),
            depends_on: Vec::new(),
            files: Vec::new(),
            phase_id: None,
            after: Vec::new(),
            approved: true,
            status: TaskStatus::Pending,
            dispatched_at: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_phase(mut self, phase_id: &str) -> Self {
        self.phase_id = Some(phase_id.to_string());
        self
    }

    pub fn unapproved(mut self) -> Self {
        self.approved = false;
        self
    }

    /// Mark that a context build was requested for this task.
    pub fn begin_context_build(&mut self) {
        self.status = TaskStatus::ContextBuilding;
    }

    /// Mark the execution trigger as published.
    ///
    /// The first dispatch time is kept across crash-recovery re-dispatches.
    pub fn mark_dispatched(&mut self) {
        self.status = TaskStatus::Dispatched;
        if self.dispatched_at.is_none() {
            self.dispatched_at = Some(Utc::now());
        }
    }

    /// Mark the task as successfully completed.
    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as failed with a reason.
    pub fn fail(&mut self, reason: &str) {
        self.status = TaskStatus::Failed {
            reason: reason.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Pass over the task without dispatching it.
    pub fn skip(&mut self, reason: &str) {
        self.status = TaskStatus::Skipped {
            reason: reason.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Return an in-flight context build to `Pending` after a restart.
    pub fn reset_context_build(&mut self) {
        if self.status == TaskStatus::ContextBuilding {
            self.status = TaskStatus::Pending;
        }
    }

    /// Completed, Failed or Skipped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Skipped { .. }
        )
    }

    /// Whether dependents may start: the task completed or was skipped.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Skipped { .. }
        )
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, TaskStatus::Skipped { .. })
    }

    /// ContextBuilding or Dispatched; counted against `max_concurrent`.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::ContextBuilding | TaskStatus::Dispatched
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, TaskStatus::Failed { .. })
    }

    /// Whether an execution trigger was ever published for this task.
    pub fn was_dispatched(&self) -> bool {
        self.dispatched_at.is_some()
    }

    /// Failure reason, if the task failed.
    pub fn failure_reason(&self) -> Option<&str> {
        match &self.status {
            TaskStatus::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    /// Reason attached to a failed or skipped task.
    pub fn status_reason(&self) -> Option<&str> {
        match &self.status {
            TaskStatus::Failed { reason } | TaskStatus::Skipped { reason } => Some(reason),
            _ => None,
        }
    }
}
