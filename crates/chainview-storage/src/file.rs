//! JSON-file cursor store.
//!
//! Keeps every cursor of a process in one small JSON document. Each save
//! rewrites the document to a sibling temp file and renames it over the
//! original, so a crash mid-write leaves the previous cursors intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use chainview_core::cursor::{CursorRecord, CursorStore};
use chainview_core::error::IndexerError;

/// File-backed [`CursorStore`].
pub struct FileCursorStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, CursorRecord>>,
}

impl FileCursorStore {
    /// Open the cursor file at `path`, creating it on first save.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, IndexerError> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => {
                let list: Vec<CursorRecord> = serde_json::from_slice(&bytes).map_err(|e| {
                    IndexerError::Storage(format!("corrupt cursor file {}: {e}", path.display()))
                })?;
                list.into_iter().map(|r| (r.stream_key.clone(), r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(IndexerError::Storage(e.to_string())),
        };
        debug!(path = %path.display(), cursors = records.len(), "cursor file opened");
        Ok(Self { path, records: Mutex::new(records) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, records: &BTreeMap<String, CursorRecord>) -> Result<(), IndexerError> {
        let list: Vec<&CursorRecord> = records.values().collect();
        let json =
            serde_json::to_vec_pretty(&list).map_err(|e| IndexerError::Storage(e.to_string()))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| IndexerError::Storage(e.to_string()))?;
        }
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| IndexerError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self, stream_key: &str) -> Result<Option<CursorRecord>, IndexerError> {
        Ok(self.records.lock().await.get(stream_key).cloned())
    }

    async fn save(&self, record: CursorRecord) -> Result<(), IndexerError> {
        let mut records = self.records.lock().await;
        let previous = records.insert(record.stream_key.clone(), record.clone());
        if let Err(e) = self.persist(&records).await {
            // keep memory and disk in agreement
            match previous {
                Some(prev) => records.insert(record.stream_key.clone(), prev),
                None => records.remove(&record.stream_key),
            };
            return Err(e);
        }
        debug!(stream = %record.stream_key, sequence = %record.sequence, "cursor saved");
        Ok(())
    }

    async fn delete(&self, stream_key: &str) -> Result<(), IndexerError> {
        let mut records = self.records.lock().await;
        if records.remove(stream_key).is_some() {
            self.persist(&records).await?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CursorRecord>, IndexerError> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}
