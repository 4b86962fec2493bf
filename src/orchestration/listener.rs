//! Completion listener: screens executor signals before they touch the graph.
//!
//! Delivery is at-least-once and unordered, so a signal may arrive for a
//! batch that already drained, twice for the same task, or before the
//! dispatcher recorded the dispatch. Such signals are discarded, never
//! treated as errors.

use crate::core::dag::TaskGraph;
use crate::core::task::{BatchId, TaskStatus};
use crate::protocol::CompletionSignal;

/// Why a completion signal was discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discard {
    OtherBatch,
    UnknownTask,
    /// The task is not Dispatched (duplicate or out-of-order signal).
    NotDispatched(&'static str),
}

impl std::fmt::Display for Discard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Discard::OtherBatch => write!(f, "signal for another batch"),
            Discard::UnknownTask => write!(f, "unknown task"),
            Discard::NotDispatched(status) => write!(f, "task is {}, not dispatched", status),
        }
    }
}

/// Decide whether `signal` may be applied to `graph`.
pub fn screen(
    batch_id: &BatchId,
    graph: &TaskGraph,
    signal: &CompletionSignal,
) -> Result<(), Discard> {
    if &signal.batch_id != batch_id {
        return Err(Discard::OtherBatch);
    }
    let task = graph.get(&signal.task_id).ok_or(Discard::UnknownTask)?;
    if task.status != TaskStatus::Dispatched {
        return Err(Discard::NotDispatched(task.status.name()));
    }
    Ok(())
}
