//! JSON-lines transport over stdin/stdout.
//!
//! Each outbound envelope is written as one JSON object per line. Inbound
//! messages are read the same way, one [`Inbound`] per line.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::Mutex;

use super::{Envelope, Publisher};
use crate::error::{Error, Result};
use crate::protocol::{Inbound, Outbound};

/// Writes envelopes as JSON lines to any async writer.
pub struct LinePublisher<W> {
    writer: Mutex<W>,
}

/// Publisher bound to the process's stdout.
pub type StdioPublisher = LinePublisher<tokio::io::Stdout>;

impl StdioPublisher {
    pub fn stdout() -> Self {
        LinePublisher::new(tokio::io::stdout())
    }
}

impl<W> LinePublisher<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> Publisher for LinePublisher<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn publish(&self, subject: &str, message: &Outbound) -> Result<()> {
        let envelope = Envelope {
            subject: subject.to_string(),
            message: message.clone(),
        };
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        let written = match writer.write_all(&line).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        written.map_err(|e| Error::Publish {
            subject: subject.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Reads inbound messages, one JSON object per line.
pub struct InboundReader<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin> InboundReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }

    /// Next message, `None` at end of input.
    ///
    /// Blank lines are skipped. A malformed line yields `Some(Err(..))` and
    /// the reader stays usable.
    pub async fn next(&mut self) -> Option<Result<Inbound>> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => return Some(Inbound::decode(line.as_bytes())),
                Ok(None) => return None,
                Err(e) => return Some(Err(Error::Io(e))),
            }
        }
    }
}
