//! Dispatch publisher: hands a task with ready context to the executor.

use tracing::{debug, info};

use crate::core::dag::TaskGraph;
use crate::core::task::{BatchId, TaskId, TaskStatus};
use crate::error::Result;
use crate::orchestration::outlet::Outlet;
use crate::protocol::{DispatchTrigger, Outbound};

/// Result of a dispatch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The execution trigger was published and the task is now Dispatched.
    Published,
    /// The task was already Dispatched or terminal; nothing was sent.
    Skipped,
}

/// Publishes execution triggers, at most once per task state.
#[derive(Debug, Clone)]
pub struct DispatchPublisher {
    outlet: Outlet,
}

impl DispatchPublisher {
    pub fn new(outlet: Outlet) -> Self {
        Self { outlet }
    }

    /// Publish the execution trigger for `task_id`, then mark it Dispatched.
    ///
    /// A task that is already Dispatched or terminal is left alone. On a
    /// publish error the task status is unchanged and the error is returned.
    pub async fn dispatch(
        &self,
        graph: &mut TaskGraph,
        batch_id: &BatchId,
        plan_slug: &str,
        task_id: &TaskId,
        context_reference: &str,
    ) -> Result<DispatchOutcome> {
        let task = graph.task(task_id)?;
        if task.status == TaskStatus::Dispatched || task.is_terminal() {
            debug!(%batch_id, %task_id, status = %task.status, "dispatch skipped");
            return Ok(DispatchOutcome::Skipped);
        }

        let trigger = DispatchTrigger::new(batch_id, plan_slug, task, context_reference);
        let dispatch_id = trigger.dispatch_id.clone();
        self.outlet.send(&Outbound::ExecutionTrigger(trigger)).await?;

        graph.task_mut(task_id)?.mark_dispatched();
        self.outlet.stats().task_dispatched();
        info!(%batch_id, %task_id, %dispatch_id, "task dispatched");
        Ok(DispatchOutcome::Published)
    }
}
