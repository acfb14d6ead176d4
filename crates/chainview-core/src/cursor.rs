//! Cursor store: persists, per stream, the last fully applied sequence.
//!
//! On restart the engine resumes from `cursor.next()`, giving at-least-once
//! consumption; entity watermarks turn the replayed tail into a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::Sequence;

/// A persisted cursor for one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRecord {
    pub stream_key: String,
    /// Last successfully processed sequence.
    pub sequence: Sequence,
    /// Unix timestamp of when this cursor was saved.
    pub updated_at: i64,
}

/// Persistence backend for cursors.
///
/// Implementations include [`MemoryCursorStore`] and the file/SQLite stores
/// in `chainview-storage`. Backends only store; monotonicity is enforced by
/// [`CursorManager`].
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, stream_key: &str) -> Result<Option<CursorRecord>, IndexerError>;

    /// Save (upsert) a cursor.
    async fn save(&self, record: CursorRecord) -> Result<(), IndexerError>;

    async fn delete(&self, stream_key: &str) -> Result<(), IndexerError>;

    /// All stored cursors, for inspection.
    async fn list(&self) -> Result<Vec<CursorRecord>, IndexerError>;
}

/// Monotonic cursor semantics on top of a [`CursorStore`].
#[derive(Clone)]
pub struct CursorManager {
    store: Arc<dyn CursorStore>,
    // serializes check-then-save
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl CursorManager {
    pub fn new(store: Arc<dyn CursorStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// The last processed sequence for `stream_key`, or `None` on first run.
    pub async fn get(&self, stream_key: &str) -> Result<Option<Sequence>, IndexerError> {
        Ok(self.store.load(stream_key).await?.map(|r| r.sequence))
    }

    /// Advance the cursor. Setting the current value again is a no-op;
    /// moving backwards fails with [`IndexerError::Regression`].
    pub async fn set(&self, stream_key: &str, sequence: Sequence) -> Result<(), IndexerError> {
        let _guard = self.write_lock.lock().await;
        if let Some(current) = self.get(stream_key).await? {
            if sequence < current {
                return Err(IndexerError::Regression {
                    stream: stream_key.to_string(),
                    current,
                    attempted: sequence,
                });
            }
            if sequence == current {
                return Ok(());
            }
        }
        self.save(stream_key, sequence).await
    }

    /// Set the cursor unconditionally (explicit reset flag).
    pub async fn force_set(&self, stream_key: &str, sequence: Sequence) -> Result<(), IndexerError> {
        let _guard = self.write_lock.lock().await;
        tracing::warn!(stream = stream_key, %sequence, "cursor force-set");
        self.save(stream_key, sequence).await
    }

    /// Clear the cursor so the next run starts from its requested origin.
    pub async fn reset(&self, stream_key: &str) -> Result<(), IndexerError> {
        let _guard = self.write_lock.lock().await;
        tracing::info!(stream = stream_key, "cursor reset");
        self.store.delete(stream_key).await
    }

    pub async fn list(&self) -> Result<Vec<CursorRecord>, IndexerError> {
        self.store.list().await
    }

    async fn save(&self, stream_key: &str, sequence: Sequence) -> Result<(), IndexerError> {
        self.store
            .save(CursorRecord {
                stream_key: stream_key.to_string(),
                sequence,
                updated_at: chrono::Utc::now().timestamp(),
            })
            .await
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory cursor store for tests and ephemeral indexers.
#[derive(Default)]
pub struct MemoryCursorStore {
    data: Mutex<HashMap<String, CursorRecord>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CursorRecord>>, IndexerError> {
        self.data
            .lock()
            .map_err(|_| IndexerError::Storage("cursor map lock poisoned".into()))
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, stream_key: &str) -> Result<Option<CursorRecord>, IndexerError> {
        Ok(self.data()?.get(stream_key).cloned())
    }

    async fn save(&self, record: CursorRecord) -> Result<(), IndexerError> {
        self.data()?.insert(record.stream_key.clone(), record);
        Ok(())
    }

    async fn delete(&self, stream_key: &str) -> Result<(), IndexerError> {
        self.data()?.remove(stream_key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CursorRecord>, IndexerError> {
        let mut records: Vec<_> = self.data()?.values().cloned().collect();
        records.sort_by(|a, b| a.stream_key.cmp(&b.stream_key));
        Ok(records)
    }
}
