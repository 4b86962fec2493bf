//! Context build coordination.
//!
//! Tracks, per task, the context build request currently in flight and how
//! many attempts have been made. Every attempt gets a fresh `request_id`, so a
//! late reply to an abandoned attempt can be recognised and dropped.

use std::collections::HashMap;

use crate::core::task::{BatchId, Task, TaskId};
use crate::protocol::ContextBuildRequest;

#[derive(Debug, Clone, Default)]
struct Attempts {
    /// Request awaiting a reply; `None` while backing off between attempts.
    current: Option<String>,
    made: u32,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Try again; `attempt` attempts have failed so far.
    Retry { attempt: u32 },
    /// Out of attempts; the task fails.
    Exhausted { attempts: u32 },
}

/// Per-batch context build bookkeeping.
#[derive(Debug, Clone)]
pub struct ContextCoordinator {
    max_attempts: u32,
    inflight: HashMap<TaskId, Attempts>,
}

impl ContextCoordinator {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            inflight: HashMap::new(),
        }
    }

    /// Start a new attempt for `task` and build its request.
    pub fn begin(
        &mut self,
        batch_id: &BatchId,
        plan_slug: &str,
        task: &Task,
    ) -> ContextBuildRequest {
        let request = ContextBuildRequest::for_task(batch_id, plan_slug, task);
        let entry = self.inflight.entry(task.id.clone()).or_default();
        entry.made += 1;
        entry.current = Some(request.request_id.clone());
        request
    }

    /// Whether `request_id` is the outstanding request for `task_id`.
    pub fn is_current(&self, task_id: &TaskId, request_id: &str) -> bool {
        self.inflight
            .get(task_id)
            .and_then(|entry| entry.current.as_deref())
            == Some(request_id)
    }

    /// The task failed its current attempt and is waiting to retry.
    pub fn is_backing_off(&self, task_id: &TaskId) -> bool {
        self.inflight
            .get(task_id)
            .is_some_and(|entry| entry.current.is_none())
    }

    pub fn attempts(&self, task_id: &TaskId) -> u32 {
        self.inflight.get(task_id).map_or(0, |entry| entry.made)
    }

    /// Record that the current attempt failed (error reply, timeout or
    /// publish failure). The outstanding request is abandoned either way.
    pub fn fail_attempt(&mut self, task_id: &TaskId) -> AttemptOutcome {
        let Some(entry) = self.inflight.get_mut(task_id) else {
            return AttemptOutcome::Exhausted { attempts: 0 };
        };
        entry.current = None;
        if entry.made < self.max_attempts {
            AttemptOutcome::Retry {
                attempt: entry.made,
            }
        } else {
            let attempts = entry.made;
            self.inflight.remove(task_id);
            AttemptOutcome::Exhausted { attempts }
        }
    }

    /// Context is ready, or the task left ContextBuilding some other way.
    pub fn finish(&mut self, task_id: &TaskId) {
        self.inflight.remove(task_id);
    }

    pub fn clear(&mut self) {
        self.inflight.clear();
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}
