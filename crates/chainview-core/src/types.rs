//! Shared types for the indexing pipeline.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

// ─── Sequence ────────────────────────────────────────────────────────────────

/// Totally ordered position of an event in its source: `(block, log index)`.
///
/// The default is [`Sequence::GENESIS`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sequence {
    pub block_number: u64,
    pub log_index: u32,
}

impl Sequence {
    /// The first possible position of any stream.
    pub const GENESIS: Sequence = Sequence { block_number: 0, log_index: 0 };

    pub const fn new(block_number: u64, log_index: u32) -> Self {
        Self { block_number, log_index }
    }

    /// The last position inside `block_number`.
    pub const fn end_of_block(block_number: u64) -> Self {
        Self { block_number, log_index: u32::MAX }
    }

    /// The smallest sequence strictly greater than `self`.
    pub fn next(&self) -> Sequence {
        match self.log_index.checked_add(1) {
            Some(log_index) => Sequence { block_number: self.block_number, log_index },
            None => Sequence {
                block_number: self.block_number.saturating_add(1),
                log_index: 0,
            },
        }
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_number, self.log_index)
    }
}

// ─── Event ───────────────────────────────────────────────────────────────────

/// Named, typed payload fields of an event.
pub type Payload = BTreeMap<String, Value>;

/// An immutable event observed on an append-only source.
///
/// Payloads arrive already decoded; the engine never inspects raw log data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the source. Unique per stream.
    pub sequence: Sequence,
    /// Event name (e.g. `"Transfer"`, `"VaultRegistered"`).
    pub event_type: String,
    /// Emitting contract address.
    pub origin: String,
    /// Decoded fields.
    #[serde(default)]
    pub payload: Payload,
    /// Block timestamp (seconds since epoch).
    pub observed_at: i64,
    /// Transaction hash, when the source provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

impl Event {
    pub fn new(sequence: Sequence, event_type: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            sequence,
            event_type: event_type.into(),
            origin: origin.into(),
            payload: Payload::new(),
            observed_at: 0,
            tx_hash: None,
        }
    }

    /// Add a payload field.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(field.into(), value.into());
        self
    }

    pub fn observed_at(mut self, ts: i64) -> Self {
        self.observed_at = ts;
        self
    }

    /// Look up a payload field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }
}

// ─── EventTypeFilter ─────────────────────────────────────────────────────────

/// Which event types to pull from a source (empty = all).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeFilter {
    pub event_types: Vec<String>,
}

impl EventTypeFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { event_types: types.into_iter().map(Into::into).collect() }
    }

    /// Returns `true` if `event_type` passes this filter.
    pub fn matches(&self, event_type: &str) -> bool {
        self.event_types.is_empty() || self.event_types.iter().any(|t| t == event_type)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
