//! In-process message bus.
//!
//! Records every published envelope and fans it out to subscribers over a
//! broadcast channel. Used by the `run` command and throughout the tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

use super::{Envelope, Publisher};
use crate::error::{Error, Result};
use crate::protocol::Outbound;

const BROADCAST_CAPACITY: usize = 1024;

/// In-memory publisher with failure injection.
pub struct MemoryBus {
    published: Mutex<Vec<Envelope>>,
    /// Remaining forced failures, keyed by message kind.
    failures: Mutex<HashMap<&'static str, usize>>,
    tx: broadcast::Sender<Envelope>,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            published: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Receive every envelope published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Make the next `count` publishes of `kind` (see [`Outbound::kind`]) fail.
    pub fn fail_next(&self, kind: &'static str, count: usize) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.insert(kind, count);
    }

    /// Every envelope successfully published so far, in order.
    pub fn published(&self) -> Vec<Envelope> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Published messages of one kind.
    pub fn messages_of(&self, kind: &str) -> Vec<Outbound> {
        self.published()
            .into_iter()
            .filter(|envelope| envelope.message.kind() == kind)
            .map(|envelope| envelope.message)
            .collect()
    }

    pub fn count_of(&self, kind: &str) -> usize {
        self.messages_of(kind).len()
    }

    fn take_failure(&self, kind: &'static str) -> bool {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        match failures.get_mut(kind) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for MemoryBus {
    async fn publish(&self, subject: &str, message: &Outbound) -> Result<()> {
        if self.take_failure(message.kind()) {
            return Err(Error::Publish {
                subject: subject.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let envelope = Envelope {
            subject: subject.to_string(),
            message: message.clone(),
        };
        trace!(subject, kind = message.kind(), "memory bus publish");
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(envelope.clone());
        // No subscribers is fine
        let _ = self.tx.send(envelope);
        Ok(())
    }
}
