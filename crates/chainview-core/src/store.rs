//! Materialized store: entity type → entity id → current projection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::entity::Entity;
use crate::error::IndexerError;
use crate::query::{evaluate, QueryPage, QuerySpec};

/// Storage for materialized entities.
///
/// Each `upsert` must be atomic with respect to concurrent readers: a query
/// sees an entity either before or after a reducer application, never a
/// partial write.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn upsert(&self, entity_type: &str, entity: Entity) -> Result<(), IndexerError>;

    async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Entity>, IndexerError>;

    /// A fresh snapshot per call; results do not track later mutations.
    async fn query(&self, entity_type: &str, spec: &QuerySpec) -> Result<QueryPage, IndexerError>;

    /// Drop every entity that `stream` contributed to. Returns the count.
    async fn purge_stream(&self, stream: &str) -> Result<usize, IndexerError>;

    /// Streams that fed any entity `stream` fed, `stream` included. These are
    /// the streams a purge of `stream` takes contributions away from.
    async fn streams_sharing(&self, stream: &str) -> Result<BTreeSet<String>, IndexerError>;

    /// Drop every entity of `entity_type`.
    async fn clear(&self, entity_type: &str) -> Result<(), IndexerError>;

    /// The schema tag stored alongside `entity_type`, if any.
    async fn schema_version(&self, entity_type: &str) -> Result<Option<u32>, IndexerError>;

    async fn set_schema_version(&self, entity_type: &str, version: u32) -> Result<(), IndexerError>;
}

#[derive(Default)]
struct Tables {
    // BTreeMap keeps ids ordered so unsorted scans are deterministic too.
    entities: HashMap<String, BTreeMap<String, Entity>>,
    schemas: HashMap<String, u32>,
}

/// In-memory materialized store.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct MemoryEntityStore {
    tables: RwLock<Tables>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entities of `entity_type`.
    pub fn len(&self, entity_type: &str) -> usize {
        self.tables
            .read()
            .map(|t| t.entities.get(entity_type).map_or(0, |m| m.len()))
            .unwrap_or(0)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, IndexerError> {
        self.tables
            .read()
            .map_err(|_| IndexerError::Storage("entity table lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, IndexerError> {
        self.tables
            .write()
            .map_err(|_| IndexerError::Storage("entity table lock poisoned".into()))
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn upsert(&self, entity_type: &str, entity: Entity) -> Result<(), IndexerError> {
        self.write()?
            .entities
            .entry(entity_type.to_string())
            .or_default()
            .insert(entity.id.clone(), entity);
        Ok(())
    }

    async fn get(&self, entity_type: &str, id: &str) -> Result<Option<Entity>, IndexerError> {
        Ok(self
            .read()?
            .entities
            .get(entity_type)
            .and_then(|m| m.get(id))
            .cloned())
    }

    async fn query(&self, entity_type: &str, spec: &QuerySpec) -> Result<QueryPage, IndexerError> {
        let rows: Vec<Entity> = self
            .read()?
            .entities
            .get(entity_type)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        Ok(evaluate(rows, spec))
    }

    async fn purge_stream(&self, stream: &str) -> Result<usize, IndexerError> {
        let mut tables = self.write()?;
        let mut purged = 0;
        for table in tables.entities.values_mut() {
            let before = table.len();
            table.retain(|_, e| !e.watermarks.contains_key(stream));
            purged += before - table.len();
        }
        Ok(purged)
    }

    async fn streams_sharing(&self, stream: &str) -> Result<BTreeSet<String>, IndexerError> {
        Ok(self
            .read()?
            .entities
            .values()
            .flat_map(|table| table.values())
            .filter(|e| e.watermarks.contains_key(stream))
            .flat_map(|e| e.watermarks.keys().cloned())
            .collect())
    }

    async fn clear(&self, entity_type: &str) -> Result<(), IndexerError> {
        self.write()?.entities.remove(entity_type);
        Ok(())
    }

    async fn schema_version(&self, entity_type: &str) -> Result<Option<u32>, IndexerError> {
        Ok(self.read()?.schemas.get(entity_type).copied())
    }

    async fn set_schema_version(&self, entity_type: &str, version: u32) -> Result<(), IndexerError> {
        self.write()?.schemas.insert(entity_type.to_string(), version);
        Ok(())
    }
}
