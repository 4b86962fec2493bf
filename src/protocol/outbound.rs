//! Messages emitted by the dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::task::{BatchId, Task, TaskId};

/// Every message the dispatcher publishes, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    ContextRequest(ContextBuildRequest),
    ExecutionTrigger(DispatchTrigger),
    AggregateResult(AggregateResult),
    PhaseUpdate(TaskPhaseUpdate),
}

impl Outbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::ContextRequest(_) => "context_request",
            Outbound::ExecutionTrigger(_) => "execution_trigger",
            Outbound::AggregateResult(_) => "aggregate_result",
            Outbound::PhaseUpdate(_) => "phase_update",
        }
    }

    pub fn batch_id(&self) -> &BatchId {
        match self {
            Outbound::ContextRequest(m) => &m.batch_id,
            Outbound::ExecutionTrigger(m) => &m.batch_id,
            Outbound::AggregateResult(m) => &m.batch_id,
            Outbound::PhaseUpdate(m) => &m.batch_id,
        }
    }
}

/// Asks the context builder to assemble a context bundle for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBuildRequest {
    /// Unique per attempt; replies carrying another id are stale.
    pub request_id: String,
    pub batch_id: BatchId,
    pub task_id: TaskId,
    pub plan_slug: String,
    pub files: Vec<String>,
}

impl ContextBuildRequest {
    pub fn for_task(batch_id: &BatchId, plan_slug: &str, task: &Task) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            batch_id: batch_id.clone(),
            task_id: task.id.clone(),
            plan_slug: plan_slug.to_string(),
            files: task.files.clone(),
        }
    }
}

/// Hands a task to the execution collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchTrigger {
    /// Deterministic per (batch, task) so consumers can drop re-dispatches.
    pub dispatch_id: String,
    pub task_id: TaskId,
    pub batch_id: BatchId,
    pub plan_slug: String,
    pub context_reference: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl DispatchTrigger {
    pub fn new(batch_id: &BatchId, plan_slug: &str, task: &Task, context_reference: &str) -> Self {
        Self {
            dispatch_id: dispatch_id(batch_id, &task.id),
            task_id: task.id.clone(),
            batch_id: batch_id.clone(),
            plan_slug: plan_slug.to_string(),
            context_reference: context_reference.to_string(),
            description: task.description.clone(),
        }
    }
}

/// Idempotency key for a task's execution trigger.
pub fn dispatch_id(batch_id: &BatchId, task_id: &TaskId) -> String {
    format!("{}/{}", batch_id, task_id)
}

/// Overall outcome of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    /// No task failed.
    Success,
    /// Some tasks failed and at least one completed.
    Partial,
    /// Every task failed.
    Failed,
    /// The batch was refused before any dispatch (bad graph, no tasks, ...).
    Rejected,
}

impl BatchOutcome {
    pub fn from_counts(completed: usize, failed: usize) -> Self {
        if failed == 0 {
            BatchOutcome::Success
        } else if completed > 0 {
            BatchOutcome::Partial
        } else {
            BatchOutcome::Failed
        }
    }
}

impl std::fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchOutcome::Success => write!(f, "success"),
            BatchOutcome::Partial => write!(f, "partial"),
            BatchOutcome::Failed => write!(f, "failed"),
            BatchOutcome::Rejected => write!(f, "rejected"),
        }
    }
}

/// The single terminal message summarizing a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub batch_id: BatchId,
    pub plan_slug: String,
    pub request_id: String,
    pub task_count: usize,
    pub dispatched_count: usize,
    pub failed_count: usize,
    pub status: BatchOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AggregateResult {
    /// Result for a batch refused before dispatch.
    pub fn rejected(batch_id: &BatchId, plan_slug: &str, request_id: &str, error: &str) -> Self {
        Self {
            batch_id: batch_id.clone(),
            plan_slug: plan_slug.to_string(),
            request_id: request_id.to_string(),
            task_count: 0,
            dispatched_count: 0,
            failed_count: 0,
            status: BatchOutcome::Rejected,
            error: Some(error.to_string()),
        }
    }
}

/// Best-effort per-task phase change, for observability only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPhaseUpdate {
    pub batch_id: BatchId,
    pub task_id: TaskId,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

impl TaskPhaseUpdate {
    pub fn for_task(batch_id: &BatchId, task: &Task) -> Self {
        Self {
            batch_id: batch_id.clone(),
            task_id: task.id.clone(),
            phase: task.status.name().to_string(),
            reason: task.status_reason().map(str::to_string),
            at: Utc::now(),
        }
    }
}
