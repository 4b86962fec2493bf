//! Batch lifecycle state machine with transition validation.
//!
//! A batch moves strictly forward:
//!
//! Created -> Dispatching -> Draining -> Completed
//!
//! `Draining` is entered once every task is terminal and is left only after
//! the aggregate result has been published.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// Graph built and validated; nothing dispatched yet.
    Created,
    /// Tasks are being admitted, dispatched and completed.
    Dispatching,
    /// Every task is terminal; the aggregate result awaits publication.
    Draining,
    /// The aggregate result was published. Terminal.
    Completed,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Completed)
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BatchState::Created => "created",
            BatchState::Dispatching => "dispatching",
            BatchState::Draining => "draining",
            BatchState::Completed => "completed",
        };
        write!(f, "{}", name)
    }
}

/// A record of a state transition with timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    /// The state that was entered.
    pub state: BatchState,
    /// When this state was entered.
    pub entered_at: DateTime<Utc>,
}

/// Current batch state plus the history of states visited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchLifecycle {
    state: BatchState,
    history: Vec<StateHistoryEntry>,
}

impl BatchLifecycle {
    /// Start a new lifecycle in `Created`.
    pub fn new() -> Self {
        Self {
            state: BatchState::Created,
            history: vec![StateHistoryEntry {
                state: BatchState::Created,
                entered_at: Utc::now(),
            }],
        }
    }

    /// Check if a transition to the target state is valid from the current state.
    pub fn can_transition(&self, target: BatchState) -> bool {
        matches!(
            (self.state, target),
            (BatchState::Created, BatchState::Dispatching)
                | (BatchState::Dispatching, BatchState::Draining)
                | (BatchState::Draining, BatchState::Completed)
        )
    }

    /// Attempt to move to `target`.
    ///
    /// Returns `InvalidStateTransition` for anything but the next state.
    pub fn transition(&mut self, target: BatchState) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }

        self.state = target;
        self.history.push(StateHistoryEntry {
            state: target,
            entered_at: Utc::now(),
        });
        Ok(())
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn history(&self) -> &[StateHistoryEntry] {
        &self.history
    }
}

impl Default for BatchLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
