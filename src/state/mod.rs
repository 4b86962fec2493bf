//! Durable state for the dispatcher.
//!
//! Task snapshots are read from plan storage; batch progress is written to a
//! ledger so a restarted dispatcher can resume where it stopped.

mod ledger;
mod tasks;

pub use ledger::{BatchLedger, BatchRecord, FileLedger, MemoryLedger};
pub use tasks::{
    parse_phases, parse_tasks, validate_slug, FileTaskSource, InlineTaskSource, PlanTask,
    TaskSource, APPROVED, PHASES_FILE, TASKS_FILE,
};
