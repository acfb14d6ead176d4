//! Indexer configuration and state types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::retry::RetryConfig;
use crate::types::EventTypeFilter;

/// Configuration for an indexer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Maximum number of events returned by one fetch.
    pub max_batch_size: usize,
    /// Maximum number of blocks scanned by one source call.
    pub block_range: u64,
    /// Per-call source timeout (milliseconds). A timeout counts as a
    /// transient failure.
    pub fetch_timeout_ms: u64,
    /// Polling interval in live mode (milliseconds).
    pub poll_interval_ms: u64,
    /// Keep tailing the source after catching up.
    pub live: bool,
    /// Backoff policy for source calls.
    pub retry: RetryConfig,
    /// Event types pulled from the source (empty = all).
    pub event_types: EventTypeFilter,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1_000,
            block_range: 2_000,
            fetch_timeout_ms: 10_000,
            poll_interval_ms: 2_000,
            live: true,
            retry: RetryConfig::default(),
            event_types: EventTypeFilter::default(),
        }
    }
}

impl IndexerConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, IndexerError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| IndexerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.max_batch_size == 0 {
            return Err(IndexerError::Config("max_batch_size must be > 0".into()));
        }
        if self.block_range == 0 {
            return Err(IndexerError::Config("block_range must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(IndexerError::Config("retry.max_attempts must be > 0".into()));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Runtime state of one stream's consumption loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TailState {
    /// Not being indexed.
    Idle,
    /// Fetching historical batches up to the source head.
    CatchingUp,
    /// Following the head via polling or push notifications.
    Live,
    /// Stopped on request.
    Stopped,
    /// Terminated by an unrecoverable error.
    Failed,
}

impl std::fmt::Display for TailState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::CatchingUp => write!(f, "catching-up"),
            Self::Live => write!(f, "live"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
