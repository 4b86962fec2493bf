//! Batch ledger: the durable record used for crash recovery.
//!
//! The batch actor saves a full [`BatchRecord`] snapshot after every event it
//! handles. On restart the dispatcher lists unpublished records and resumes
//! them; published records make re-delivered triggers a no-op.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::core::lifecycle::{BatchLifecycle, BatchState};
use crate::core::settings::BatchSettings;
use crate::core::task::{BatchId, Task};
use crate::error::Result;
use crate::protocol::AggregateResult;

/// Snapshot of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: BatchId,
    pub plan_slug: String,
    pub request_id: String,
    pub settings: BatchSettings,
    pub lifecycle: BatchLifecycle,
    pub tasks: Vec<Task>,
    /// Computed once the batch drains.
    #[serde(default)]
    pub aggregate: Option<AggregateResult>,
    /// Whether the aggregate result reached the message log.
    #[serde(default)]
    pub published: bool,
    /// When dispatching started; anchors the execution deadline.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BatchRecord {
    /// Record for a batch refused before dispatch. Stored already published.
    pub fn rejected(result: AggregateResult, settings: BatchSettings) -> Self {
        Self {
            batch_id: result.batch_id.clone(),
            plan_slug: result.plan_slug.clone(),
            request_id: result.request_id.clone(),
            settings,
            lifecycle: BatchLifecycle::new(),
            tasks: Vec::new(),
            aggregate: Some(result),
            published: true,
            started_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn state(&self) -> BatchState {
        self.lifecycle.state()
    }

    /// The batch needs no further work.
    pub fn is_finished(&self) -> bool {
        self.published
    }
}

/// Durable storage for batch records.
#[async_trait]
pub trait BatchLedger: Send + Sync {
    /// Insert or replace the record for `record.batch_id`.
    async fn save(&self, record: &BatchRecord) -> Result<()>;

    async fn load(&self, batch_id: &BatchId) -> Result<Option<BatchRecord>>;

    /// Every stored record, oldest update first.
    async fn list(&self) -> Result<Vec<BatchRecord>>;

    /// Records whose aggregate result has not been published yet.
    async fn unfinished(&self) -> Result<Vec<BatchRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|record| !record.is_finished())
            .collect())
    }
}

/// Ledger kept in memory, shared across "restarts" within one process.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<BatchId, BatchRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BatchLedger for MemoryLedger {
    async fn save(&self, record: &BatchRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(record.batch_id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, batch_id: &BatchId) -> Result<Option<BatchRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(batch_id).cloned())
    }

    async fn list(&self) -> Result<Vec<BatchRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut result: Vec<_> = records.values().cloned().collect();
        result.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(result)
    }
}

/// One JSON file per batch under a directory.
///
/// Writes go to a temporary file that is then renamed over the record, so a
/// crash mid-write leaves the previous snapshot intact.
#[derive(Debug, Clone)]
pub struct FileLedger {
    dir: PathBuf,
}

impl FileLedger {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding a batch's record. Characters unsafe in file names are
    /// replaced with `_`.
    pub fn record_path(&self, batch_id: &BatchId) -> PathBuf {
        let name: String = batch_id
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl BatchLedger for FileLedger {
    async fn save(&self, record: &BatchRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.record_path(&record.batch_id);
        let tmp = path.with_extension("json.tmp");

        let bytes = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(batch_id = %record.batch_id, state = %record.state(), "ledger saved");
        Ok(())
    }

    async fn load(&self, batch_id: &BatchId) -> Result<Option<BatchRecord>> {
        let path = self.record_path(batch_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<BatchRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<BatchRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable ledger record")
                }
            }
        }
        records.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(records)
    }
}
