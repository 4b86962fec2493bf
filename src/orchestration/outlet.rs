//! Shared publishing handle handed to every batch.

use std::sync::Arc;

use crate::error::Result;
use crate::orchestration::stats::DispatcherStats;
use crate::protocol::{Outbound, Subjects};
use crate::transport::Publisher;

/// Publisher, subject naming and counters, bundled for cheap cloning.
#[derive(Clone)]
pub struct Outlet {
    publisher: Arc<dyn Publisher>,
    subjects: Subjects,
    stats: Arc<DispatcherStats>,
}

impl Outlet {
    pub fn new(publisher: Arc<dyn Publisher>, subjects: Subjects) -> Self {
        Self {
            publisher,
            subjects,
            stats: Arc::new(DispatcherStats::new()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<DispatcherStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Publish `message` on the subject its kind maps to.
    pub async fn send(&self, message: &Outbound) -> Result<()> {
        let subject = self.subjects.for_message(message);
        self.publisher.publish(&subject, message).await
    }

    pub fn subjects(&self) -> &Subjects {
        &self.subjects
    }

    pub fn stats(&self) -> &Arc<DispatcherStats> {
        &self.stats
    }
}

impl std::fmt::Debug for Outlet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outlet")
            .field("subjects", &self.subjects)
            .finish_non_exhaustive()
    }
}
