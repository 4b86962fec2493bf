//! Messages consumed by the dispatcher.

use serde::{Deserialize, Serialize};

use crate::core::task::{BatchId, TaskId};
use crate::error::{Error, Result};

/// Every message the dispatcher accepts, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    BatchTrigger(BatchTrigger),
    ContextResult(ContextBuildResult),
    Completion(CompletionSignal),
    Cancel(CancelBatch),
}

impl Inbound {
    /// Decode and validate a JSON message.
    ///
    /// Malformed input is rejected here, before it can reach scheduler logic.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let message: Inbound = serde_json::from_slice(bytes)
            .map_err(|e| Error::MalformedMessage(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Inbound::BatchTrigger(m) => m.validate(),
            Inbound::ContextResult(m) => m.validate(),
            Inbound::Completion(m) => m.validate(),
            Inbound::Cancel(m) => m.validate(),
        }
    }

    /// The batch this message belongs to.
    pub fn batch_id(&self) -> &BatchId {
        match self {
            Inbound::BatchTrigger(m) => &m.batch_id,
            Inbound::ContextResult(m) => &m.batch_id,
            Inbound::Completion(m) => &m.batch_id,
            Inbound::Cancel(m) => &m.batch_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::BatchTrigger(_) => "batch_trigger",
            Inbound::ContextResult(_) => "context_result",
            Inbound::Completion(_) => "completion",
            Inbound::Cancel(_) => "cancel",
        }
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::MalformedMessage(format!("{} is required", field)));
    }
    Ok(())
}

/// Starts a dispatch run for a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTrigger {
    pub request_id: String,
    #[serde(alias = "slug")]
    pub plan_slug: String,
    pub batch_id: BatchId,
}

impl BatchTrigger {
    pub fn new(request_id: &str, plan_slug: &str, batch_id: BatchId) -> Self {
        Self {
            request_id: request_id.to_string(),
            plan_slug: plan_slug.to_string(),
            batch_id,
        }
    }

    pub fn validate(&self) -> Result<()> {
        require("request_id", &self.request_id)?;
        require("plan_slug", &self.plan_slug)?;
        require("batch_id", self.batch_id.as_str())
    }
}

/// Reply from the context builder for one request.
///
/// Exactly one of `context_reference` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBuildResult {
    pub request_id: String,
    pub batch_id: BatchId,
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ContextBuildResult {
    pub fn ready(request_id: &str, batch_id: BatchId, task_id: TaskId, reference: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            batch_id,
            task_id,
            context_reference: Some(reference.to_string()),
            error: None,
        }
    }

    pub fn failed(request_id: &str, batch_id: BatchId, task_id: TaskId, error: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            batch_id,
            task_id,
            context_reference: None,
            error: Some(error.to_string()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        require("request_id", &self.request_id)?;
        require("batch_id", self.batch_id.as_str())?;
        require("task_id", self.task_id.as_str())?;
        match (&self.context_reference, &self.error) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(Error::MalformedMessage(
                "exactly one of context_reference or error is required".to_string(),
            )),
        }
    }

    /// The context reference on success, the error text otherwise.
    pub fn outcome(&self) -> std::result::Result<&str, &str> {
        match (&self.context_reference, &self.error) {
            (_, Some(error)) => Err(error.as_str()),
            (Some(reference), None) => Ok(reference.as_str()),
            (None, None) => Err("context build returned neither reference nor error"),
        }
    }
}

/// Outcome reported by the task executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Success,
    Failure,
}

/// Completion or failure of a dispatched task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub task_id: TaskId,
    pub batch_id: BatchId,
    pub status: CompletionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompletionSignal {
    pub fn success(batch_id: BatchId, task_id: TaskId) -> Self {
        Self {
            task_id,
            batch_id,
            status: CompletionStatus::Success,
            error: None,
        }
    }

    pub fn failure(batch_id: BatchId, task_id: TaskId, error: &str) -> Self {
        Self {
            task_id,
            batch_id,
            status: CompletionStatus::Failure,
            error: Some(error.to_string()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        require("task_id", self.task_id.as_str())?;
        require("batch_id", self.batch_id.as_str())
    }
}

/// External request to stop a batch, e.g. because its plan was superseded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelBatch {
    pub batch_id: BatchId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CancelBatch {
    pub fn validate(&self) -> Result<()> {
        require("batch_id", self.batch_id.as_str())
    }
}
