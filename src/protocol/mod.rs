//! Wire messages exchanged with the dispatcher's collaborators.
//!
//! Every message is an explicit struct with required fields, JSON-encoded and
//! tagged by `type`. Inbound messages are validated on decode; outbound
//! messages are routed to subjects derived from [`Subjects`].

mod inbound;
mod outbound;

use serde::{Deserialize, Serialize};

use crate::core::task::BatchId;

pub use inbound::{
    BatchTrigger, CancelBatch, CompletionSignal, CompletionStatus, ContextBuildResult, Inbound,
};
pub use outbound::{
    dispatch_id, AggregateResult, BatchOutcome, ContextBuildRequest, DispatchTrigger, Outbound,
    TaskPhaseUpdate,
};

/// Subject names used for outbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Subjects {
    /// Prefix for context build requests (`<prefix>.implementation`).
    pub context_request_prefix: String,
    /// Subject that triggers the task execution workflow.
    pub execution_trigger: String,
    /// Prefix for aggregate results (`<prefix>.<batch_id>`).
    pub result_prefix: String,
    /// Prefix for per-task phase updates (`<prefix>.<batch_id>`).
    pub phase_prefix: String,
}

impl Default for Subjects {
    fn default() -> Self {
        Self {
            context_request_prefix: "context.build".to_string(),
            execution_trigger: "workflow.trigger.task-execution-loop".to_string(),
            result_prefix: "workflow.result.task-dispatcher".to_string(),
            phase_prefix: "workflow.phase.task-dispatcher".to_string(),
        }
    }
}

impl Subjects {
    pub fn context_request(&self) -> String {
        format!("{}.implementation", self.context_request_prefix)
    }

    pub fn execution_trigger(&self) -> String {
        self.execution_trigger.clone()
    }

    pub fn result(&self, batch_id: &BatchId) -> String {
        format!("{}.{}", self.result_prefix, batch_id)
    }

    pub fn phase(&self, batch_id: &BatchId) -> String {
        format!("{}.{}", self.phase_prefix, batch_id)
    }

    /// The subject an outbound message is published on.
    pub fn for_message(&self, message: &Outbound) -> String {
        match message {
            Outbound::ContextRequest(_) => self.context_request(),
            Outbound::ExecutionTrigger(_) => self.execution_trigger(),
            Outbound::AggregateResult(m) => self.result(&m.batch_id),
            Outbound::PhaseUpdate(m) => self.phase(&m.batch_id),
        }
    }

    pub fn is_empty_field(&self) -> Option<&'static str> {
        [
            ("context_request_prefix", &self.context_request_prefix),
            ("execution_trigger", &self.execution_trigger),
            ("result_prefix", &self.result_prefix),
            ("phase_prefix", &self.phase_prefix),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
    }
}
