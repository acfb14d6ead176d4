//! chainview-engine: the embeddable indexer.
//!
//! Drives one consumption loop per stream: a bounded catch-up to the source
//! head, then (optionally) a live tail on source notifications or polling.
//! Entities are queried from the same [`Indexer`].

pub mod builder;
pub mod engine;
mod tail;

pub use builder::IndexerBuilder;
pub use engine::{CatchUpReport, Indexer, StartFrom, StreamHandle, TailEvent};
