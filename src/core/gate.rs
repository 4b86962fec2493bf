//! Concurrency gate.
//!
//! Bounds how many tasks may be active (context building or dispatched) at
//! once. Admission preserves the readiness engine's ordering.

use crate::core::task::TaskId;

/// A fixed concurrency ceiling for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyGate {
    max_concurrent: usize,
}

impl ConcurrencyGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self { max_concurrent }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Number of free slots given the current active count.
    pub fn free_slots(&self, active_count: usize) -> usize {
        self.max_concurrent.saturating_sub(active_count)
    }

    pub fn has_capacity(&self, active_count: usize) -> bool {
        self.free_slots(active_count) > 0
    }

    /// Admit up to the free slots' worth of tasks from `ready`, in order.
    ///
    /// Returns an empty list once the ceiling is reached.
    pub fn admit(&self, ready: &[TaskId], active_count: usize) -> Vec<TaskId> {
        ready
            .iter()
            .take(self.free_slots(active_count))
            .cloned()
            .collect()
    }
}
