//! Error types for the chainview pipeline.

use thiserror::Error;

use crate::types::{Event, Sequence};

/// Errors that can occur during indexing and querying.
#[derive(Debug, Clone, Error)]
pub enum IndexerError {
    /// The source kept failing after the retry budget was spent.
    #[error("Source unavailable for stream '{stream}' after {attempts} attempts: {reason}")]
    SourceUnavailable {
        stream: String,
        attempts: u32,
        reason: String,
    },

    /// The source no longer holds the history the cursor needs.
    /// Recovery requires `reset_cursor` and a re-index from genesis.
    #[error("Gap in stream '{stream}': requested {requested}, earliest available {earliest}")]
    Gap {
        stream: String,
        requested: Sequence,
        earliest: Sequence,
    },

    #[error("Cursor regression on stream '{stream}': {attempted} < {current}")]
    Regression {
        stream: String,
        current: Sequence,
        attempted: Sequence,
    },

    #[error("Reducer error in '{entity_type}' at {} (entity {entity_id:?}): {reason}", .event.sequence)]
    Reducer {
        entity_type: String,
        /// `None` when the id itself could not be derived.
        entity_id: Option<String>,
        event: Box<Event>,
        reason: String,
    },

    #[error("Stream '{stream}' is already being indexed")]
    AlreadyIndexing { stream: String },

    #[error("Schema mismatch for '{entity_type}': stored v{stored}, registered v{registered}")]
    SchemaMismatch {
        entity_type: String,
        stored: u32,
        registered: u32,
    },

    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    #[error("Indexing of stream '{stream}' was cancelled")]
    Cancelled { stream: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl IndexerError {
    /// Returns `true` for failures that clear up on their own (source outages).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. })
    }

    /// Returns `true` if the cursor is unrecoverable without a re-index.
    pub fn is_gap(&self) -> bool {
        matches!(self, Self::Gap { .. })
    }

    /// The event a reducer failed on, if this is a reducer error.
    pub fn failed_event(&self) -> Option<&Event> {
        match self {
            Self::Reducer { event, .. } => Some(&**event),
            _ => None,
        }
    }
}

/// Errors reported by an [`EventSource`](crate::source::EventSource).
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// History before `earliest` has been pruned.
    #[error("History pruned; earliest available is {earliest}")]
    Pruned { earliest: Sequence },

    #[error("Source disconnected: {0}")]
    Disconnected(String),

    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// Returns `true` if this error is retryable (transient).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout { .. } | Self::Disconnected(_)
        )
    }
}
