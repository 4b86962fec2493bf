//! Process-wide dispatcher counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared by every batch actor.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    batches_processed: AtomicU64,
    tasks_dispatched: AtomicU64,
    contexts_built: AtomicU64,
    executions_failed: AtomicU64,
    duplicates_discarded: AtomicU64,
}

/// Point-in-time copy of [`DispatcherStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub batches_processed: u64,
    pub tasks_dispatched: u64,
    pub contexts_built: u64,
    pub executions_failed: u64,
    pub duplicates_discarded: u64,
}

impl DispatcherStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_processed(&self) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_dispatched(&self) {
        self.tasks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn context_built(&self) {
        self.contexts_built.fetch_add(1, Ordering::Relaxed);
    }

    pub fn execution_failed(&self) {
        self.executions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_discarded(&self) {
        self.duplicates_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
            contexts_built: self.contexts_built.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            duplicates_discarded: self.duplicates_discarded.load(Ordering::Relaxed),
        }
    }
}
