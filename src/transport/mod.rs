//! Outbound transports.
//!
//! The dispatcher never talks to its collaborators directly: every hand-off
//! is a message published through a [`Publisher`]. Delivery is assumed to be
//! at-least-once, so consumers dedupe on the ids carried by each message.

mod memory;
mod stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::Outbound;

pub use memory::MemoryBus;
pub use stdio::{InboundReader, LinePublisher, StdioPublisher};

/// A message together with the subject it was published on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub subject: String,
    pub message: Outbound,
}

/// Publishes outbound messages to the message log.
///
/// Implementations must be safe to share between batch actors.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one message. An `Err` means the message may not have been
    /// delivered and the caller decides whether to retry.
    async fn publish(&self, subject: &str, message: &Outbound) -> Result<()>;
}
