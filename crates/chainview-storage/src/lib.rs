//! chainview-storage: persistent backends for ChainView.
//!
//! Backends:
//! - [`file`]: JSON-file cursor store (single process, no extra deps)
//! - [`sqlite`]: SQLite via `sqlx` (cursors, entities and schema tags)
//!
//! In-memory stores live in `chainview-core`.

#[cfg(feature = "file")]
pub mod file;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "file")]
pub use file::FileCursorStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
