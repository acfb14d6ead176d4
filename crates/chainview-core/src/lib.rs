//! chainview-core: foundation for the embeddable event-log projection engine.
//!
//! # Architecture
//!
//! ```text
//! EventSource ──► LogFetcher ──► Projector ──► EntityStore ◄── query::evaluate
//!  (head, ranges,   (batches,      (reducers,     (memory /
//!   notifications)   retry,         watermarks)    SQLite)
//!                    timeouts)           │
//!                                        ▼
//!                                  CursorManager ──► CursorStore
//! ```
//!
//! The orchestration loop (catch-up, live tail, per-stream guard) lives in
//! `chainview-engine`; persistent backends live in `chainview-storage`.

pub mod cursor;
pub mod entity;
pub mod error;
pub mod fetcher;
pub mod indexer;
pub mod projector;
pub mod query;
pub mod retry;
pub mod source;
pub mod store;
pub mod types;
pub mod value;

pub use cursor::{CursorManager, CursorRecord, CursorStore, MemoryCursorStore};
pub use entity::{Entity, EntityDefinition, EntityRegistry, EntityState, IdField, ReduceError, Reducer};
pub use error::{IndexerError, SourceError};
pub use fetcher::{FetchedBatch, LogFetcher};
pub use indexer::{IndexerConfig, TailState};
pub use projector::{ProjectOutcome, Projector};
pub use query::{EventOrder, EventQuery, Op, PageToken, Predicate, QueryPage, QuerySpec, SortOrder};
pub use retry::{RetryConfig, RetryPolicy};
pub use source::{EventSource, MemoryEventSource, Notifications};
pub use store::{EntityStore, MemoryEntityStore};
pub use types::{Event, EventTypeFilter, Payload, Sequence};
pub use value::Value;
