//! SQLite storage backend for ChainView.
//!
//! Persists cursors, entities and entity schema tags to a single SQLite file.
//! Uses `sqlx` with WAL mode so queries can read while a stream writes.
//!
//! # Usage
//! ```rust,no_run
//! use chainview_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./view.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use chainview_core::cursor::{CursorRecord, CursorStore};
use chainview_core::entity::{Entity, EntityState};
use chainview_core::error::IndexerError;
use chainview_core::query::{evaluate, QueryPage, QuerySpec};
use chainview_core::store::EntityStore;
use chainview_core::types::Sequence;

fn storage_err(e: impl std::fmt::Display) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// SQLite-backed cursor and entity storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./view.db"`) or a full
    /// SQLite URL (`"sqlite:./view.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// A single connection, since every connection to `:memory:` would see
    /// its own empty database. All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cursors (
                stream_key   TEXT    PRIMARY KEY,
                block_number INTEGER NOT NULL,
                log_index    INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS entities (
                entity_type     TEXT NOT NULL,
                entity_id       TEXT NOT NULL,
                state_json      TEXT NOT NULL,
                watermarks_json TEXT NOT NULL,
                PRIMARY KEY (entity_type, entity_id)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS entity_schemas (
                entity_type TEXT    PRIMARY KEY,
                version     INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Number of stored entities of `entity_type`.
    pub async fn entity_count(&self, entity_type: &str) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM entities WHERE entity_type = ?")
            .bind(entity_type)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }

    /// Entity types with at least one stored row, sorted.
    pub async fn entity_types(&self) -> Result<Vec<String>, IndexerError> {
        let rows = sqlx::query("SELECT DISTINCT entity_type FROM entities ORDER BY entity_type")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(rows.iter().map(|r| r.get::<String, _>("entity_type")).collect())
    }

    async fn scan(&self, entity_type: &str) -> Result<Vec<Entity>, IndexerError> {
        let rows = sqlx::query(
            "SELECT entity_id, state_json, watermarks_json
             FROM entities WHERE entity_type = ? ORDER BY entity_id",
        )
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(entity_from_row).collect()
    }
}

fn entity_from_row(row: &SqliteRow) -> Result<Entity, IndexerError> {
    let state: EntityState =
        serde_json::from_str(row.get::<&str, _>("state_json")).map_err(storage_err)?;
    let watermarks: BTreeMap<String, Sequence> =
        serde_json::from_str(row.get::<&str, _>("watermarks_json")).map_err(storage_err)?;
    Ok(Entity { id: row.get("entity_id"), state, watermarks })
}

// ─── CursorStore impl ────────────────────────────────────────────────────────

#[async_trait]
impl CursorStore for SqliteStorage {
    async fn load(&self, stream_key: &str) -> Result<Option<CursorRecord>, IndexerError> {
        let row = sqlx::query(
            "SELECT stream_key, block_number, log_index, updated_at
             FROM cursors WHERE stream_key = ?",
        )
        .bind(stream_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(row.map(|r| cursor_from_row(&r)))
    }

    async fn save(&self, record: CursorRecord) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO cursors (stream_key, block_number, log_index, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&record.stream_key)
        .bind(record.sequence.block_number as i64)
        .bind(record.sequence.log_index as i64)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(stream = %record.stream_key, sequence = %record.sequence, "cursor saved");
        Ok(())
    }

    async fn delete(&self, stream_key: &str) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM cursors WHERE stream_key = ?")
            .bind(stream_key)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CursorRecord>, IndexerError> {
        let rows = sqlx::query(
            "SELECT stream_key, block_number, log_index, updated_at
             FROM cursors ORDER BY stream_key",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(rows.iter().map(cursor_from_row).collect())
    }
}

fn cursor_from_row(r: &SqliteRow) -> CursorRecord {
    CursorRecord {
        stream_key: r.get("stream_key"),
        sequence: Sequence::new(
            r.get::<i64, _>("block_number") as u64,
            r.get::<i64, _>("log_index") as u32,
        ),
        updated_at: r.get("updated_at"),
    }
}

// ─── EntityStore impl ────────────────────────────────────────────────────────

#[async_trait]
impl EntityStore for SqliteStorage {
    async fn upsert(&self, entity_type: &str, entity: Entity) -> Result<(), IndexerError> {
        let state = serde_json::to_string(&entity.state).map_err(storage_err)?;
        let watermarks = serde_json::to_string(&entity.watermarks).map_err(storage_err)?;

        sqlx::query(
            "INSERT INTO entities (entity_type, entity_id, state_json, watermarks_json)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (entity_type, entity_id) DO UPDATE SET
                state_json = excluded.state_json,
                watermarks_json = excluded.watermarks_json",
        )
        .bind(entity_type)
        .bind(&entity.id)
        .bind(&state)
        .bind(&watermarks)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Entity>, IndexerError> {
        let row = sqlx::query(
            "SELECT entity_id, state_json, watermarks_json
             FROM entities WHERE entity_type = ? AND entity_id = ?",
        )
        .bind(entity_type)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.as_ref().map(entity_from_row).transpose()
    }

    // Predicates run over decoded values so that numeric and address
    // comparisons match the in-memory store exactly.
    async fn query(&self, entity_type: &str, spec: &QuerySpec) -> Result<QueryPage, IndexerError> {
        Ok(evaluate(self.scan(entity_type).await?, spec))
    }

    async fn purge_stream(&self, stream: &str) -> Result<usize, IndexerError> {
        let rows = sqlx::query("SELECT entity_type, entity_id, watermarks_json FROM entities")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let mut purged = 0;
        for row in &rows {
            let watermarks: BTreeMap<String, Sequence> =
                serde_json::from_str(row.get::<&str, _>("watermarks_json")).map_err(storage_err)?;
            if !watermarks.contains_key(stream) {
                continue;
            }
            sqlx::query("DELETE FROM entities WHERE entity_type = ? AND entity_id = ?")
                .bind(row.get::<&str, _>("entity_type"))
                .bind(row.get::<&str, _>("entity_id"))
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            purged += 1;
        }
        tx.commit().await.map_err(storage_err)?;

        debug!(stream, purged, "stream entities purged");
        Ok(purged)
    }

    async fn streams_sharing(&self, stream: &str) -> Result<BTreeSet<String>, IndexerError> {
        let rows = sqlx::query("SELECT watermarks_json FROM entities")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        let mut sharing = BTreeSet::new();
        for row in &rows {
            let watermarks: BTreeMap<String, Sequence> =
                serde_json::from_str(row.get::<&str, _>("watermarks_json")).map_err(storage_err)?;
            if watermarks.contains_key(stream) {
                sharing.extend(watermarks.into_keys());
            }
        }
        Ok(sharing)
    }

    async fn clear(&self, entity_type: &str) -> Result<(), IndexerError> {
        sqlx::query("DELETE FROM entities WHERE entity_type = ?")
            .bind(entity_type)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn schema_version(&self, entity_type: &str) -> Result<Option<u32>, IndexerError> {
        let row = sqlx::query("SELECT version FROM entity_schemas WHERE entity_type = ?")
            .bind(entity_type)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|r| r.get::<i64, _>("version") as u32))
    }

    async fn set_schema_version(&self, entity_type: &str, version: u32) -> Result<(), IndexerError> {
        sqlx::query("INSERT OR REPLACE INTO entity_schemas (entity_type, version) VALUES (?, ?)")
            .bind(entity_type)
            .bind(version as i64)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
