//! Fluent builder for [`Indexer`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use chainview_core::entity::{EntityDefinition, IdField};
//! use chainview_core::source::MemoryEventSource;
//! use chainview_engine::IndexerBuilder;
//!
//! let indexer = IndexerBuilder::new()
//!     .source(Arc::new(MemoryEventSource::new()))
//!     .batch_size(500)
//!     .live(false)
//!     .entity(
//!         "Holding",
//!         EntityDefinition::new(IdField::field("to"))
//!             .on("Transfer")
//!             .reduce(|prior, _event| Ok(prior.cloned().unwrap_or_default())),
//!     )
//!     .build()
//!     .unwrap();
//! assert_eq!(indexer.config().max_batch_size, 500);
//! ```

use std::sync::Arc;

use chainview_core::cursor::{CursorManager, CursorStore, MemoryCursorStore};
use chainview_core::entity::{EntityDefinition, EntityRegistry};
use chainview_core::error::IndexerError;
use chainview_core::fetcher::LogFetcher;
use chainview_core::indexer::IndexerConfig;
use chainview_core::projector::Projector;
use chainview_core::retry::RetryConfig;
use chainview_core::source::EventSource;
use chainview_core::store::{EntityStore, MemoryEntityStore};
use chainview_core::types::EventTypeFilter;

use crate::engine::Indexer;

/// Fluent builder for [`Indexer`]. Stores default to in-memory.
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
    source: Option<Arc<dyn EventSource>>,
    entity_store: Option<Arc<dyn EntityStore>>,
    cursor_store: Option<Arc<dyn CursorStore>>,
    entities: Vec<(String, EntityDefinition)>,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The event source to consume (required).
    pub fn source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn entity_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.entity_store = Some(store);
        self
    }

    pub fn cursor_store(mut self, store: Arc<dyn CursorStore>) -> Self {
        self.cursor_store = Some(store);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: IndexerConfig) -> Self {
        self.config = config;
        self
    }

    /// Maximum events per fetch.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.max_batch_size = size;
        self
    }

    /// Maximum blocks scanned per source call.
    pub fn block_range(mut self, blocks: u64) -> Self {
        self.config.block_range = blocks;
        self
    }

    pub fn fetch_timeout_ms(mut self, ms: u64) -> Self {
        self.config.fetch_timeout_ms = ms;
        self
    }

    /// Set live mode polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Keep tailing after catch-up (default `true`).
    pub fn live(mut self, live: bool) -> Self {
        self.config.live = live;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Restrict the event types pulled from the source.
    pub fn event_types(mut self, filter: EventTypeFilter) -> Self {
        self.config.event_types = filter;
        self
    }

    /// Register an entity type up front.
    pub fn entity(mut self, entity_type: impl Into<String>, definition: EntityDefinition) -> Self {
        self.entities.push((entity_type.into(), definition));
        self
    }

    /// Build the `IndexerConfig` only.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Validate the configuration and assemble the indexer.
    pub fn build(self) -> Result<Indexer, IndexerError> {
        self.config.validate()?;
        let source = self
            .source
            .ok_or_else(|| IndexerError::Config("an event source is required".into()))?;
        let entity_store = self
            .entity_store
            .unwrap_or_else(|| Arc::new(MemoryEntityStore::new()) as Arc<dyn EntityStore>);
        let cursor_store = self
            .cursor_store
            .unwrap_or_else(|| Arc::new(MemoryCursorStore::new()) as Arc<dyn CursorStore>);

        let indexer = Indexer::from_parts(
            self.config.clone(),
            LogFetcher::new(source, &self.config),
            Projector::new(entity_store),
            CursorManager::new(cursor_store),
            EntityRegistry::new(),
        );
        for (entity_type, definition) in self.entities {
            indexer.register_entity(entity_type, definition)?;
        }
        Ok(indexer)
    }
}
