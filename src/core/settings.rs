//! Per-batch scheduling settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on any single retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// What happens to the rest of the batch when a task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail every transitive dependent; independent branches keep running.
    #[default]
    FailFast,
    /// Fail every non-terminal task on the first failure.
    AbortAll,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::FailFast => write!(f, "fail_fast"),
            FailurePolicy::AbortAll => write!(f, "abort_all"),
        }
    }
}

/// Knobs fixed for the lifetime of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Ceiling on tasks in ContextBuilding or Dispatched.
    pub max_concurrent: usize,
    pub failure_policy: FailurePolicy,
    /// Per-attempt wait for a context build result.
    pub context_timeout_secs: u64,
    /// Attempts before a task fails on context build.
    pub context_max_attempts: u32,
    /// Base delay between context build attempts.
    pub context_retry_backoff_ms: u64,
    /// Deadline for the whole batch, measured from start.
    pub execution_timeout_secs: u64,
    /// Base delay between aggregate publication attempts.
    pub publish_retry_backoff_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            failure_policy: FailurePolicy::FailFast,
            context_timeout_secs: 30,
            context_max_attempts: 3,
            context_retry_backoff_ms: 1000,
            execution_timeout_secs: 300,
            publish_retry_backoff_ms: 500,
        }
    }
}

impl BatchSettings {
    pub fn context_timeout(&self) -> Duration {
        Duration::from_secs(self.context_timeout_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    /// Delay before context attempt `attempt + 1`, given `attempt` failed.
    pub fn context_backoff(&self, attempt: u32) -> Duration {
        backoff(self.context_retry_backoff_ms, attempt)
    }

    /// Delay before retrying aggregate publication after `attempt` failures.
    pub fn publish_backoff(&self, attempt: u32) -> Duration {
        backoff(self.publish_retry_backoff_ms, attempt)
    }
}

/// `base * 2^(attempt-1)`, capped at [`MAX_BACKOFF`].
pub fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let millis = base_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(millis).min(MAX_BACKOFF)
}
