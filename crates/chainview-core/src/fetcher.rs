//! Log fetcher: pulls ordered, bounded batches from an [`EventSource`].
//!
//! Every source call runs under a timeout and the bounded backoff of
//! [`RetryPolicy`]. The batch reports how far it scanned separately from what
//! it found, so the cursor can move over ranges with no matching events.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{IndexerError, SourceError};
use crate::indexer::IndexerConfig;
use crate::retry::RetryPolicy;
use crate::source::EventSource;
use crate::types::{Event, EventTypeFilter, Sequence};

/// Result of one [`LogFetcher::fetch_batch`] call.
#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    /// Strictly ascending, duplicate-free.
    pub events: Vec<Event>,
    /// Highest position covered by this scan; `None` when nothing was scanned
    /// because `from` is already past the head.
    pub scanned_to: Option<Sequence>,
    /// Source head observed for this batch. `head >= max(event.sequence)`.
    pub head: Sequence,
}

impl FetchedBatch {
    /// Returns `true` if the scan reached the observed head.
    pub fn reached_head(&self) -> bool {
        self.scanned_to.map_or(true, |s| s >= self.head)
    }
}

/// Wraps an [`EventSource`] with batching, timeouts and retries.
#[derive(Clone)]
pub struct LogFetcher {
    source: Arc<dyn EventSource>,
    retry: RetryPolicy,
    timeout: Duration,
    max_batch_size: usize,
    block_range: u64,
}

impl LogFetcher {
    pub fn new(source: Arc<dyn EventSource>, config: &IndexerConfig) -> Self {
        Self {
            source,
            retry: RetryPolicy::new(config.retry.clone()),
            timeout: config.fetch_timeout(),
            max_batch_size: config.max_batch_size.max(1),
            block_range: config.block_range.max(1),
        }
    }

    pub fn source(&self) -> &Arc<dyn EventSource> {
        &self.source
    }

    /// Current head of `stream`.
    pub async fn head(&self, stream: &str) -> Result<Sequence, IndexerError> {
        self.call(stream, || self.source.head(stream)).await
    }

    /// Fetch the next batch of `stream` starting at `from` (inclusive).
    pub async fn fetch_batch(
        &self,
        stream: &str,
        from: Sequence,
        filter: &EventTypeFilter,
    ) -> Result<FetchedBatch, IndexerError> {
        let head = self.head(stream).await?;
        if from > head {
            return Ok(FetchedBatch { events: vec![], scanned_to: None, head });
        }

        let window_end = Sequence::end_of_block(
            from.block_number.saturating_add(self.block_range - 1),
        )
        .min(head);

        let mut events = self
            .call(stream, || self.source.fetch_range(stream, from, window_end, filter))
            .await
            .map_err(|e| match e {
                IndexerError::Gap { stream, earliest, .. } => IndexerError::Gap {
                    stream,
                    requested: from,
                    earliest,
                },
                other => other,
            })?;

        // Sources promise order; enforce it anyway and drop anything outside
        // the requested window.
        events.retain(|e| e.sequence >= from && e.sequence <= window_end);
        events.sort_by_key(|e| e.sequence);
        events.dedup_by_key(|e| e.sequence);

        let scanned_to = if events.len() > self.max_batch_size {
            events.truncate(self.max_batch_size);
            events.last().map(|e| e.sequence)
        } else {
            Some(window_end)
        };

        debug!(
            stream,
            %from,
            scanned_to = ?scanned_to,
            %head,
            events = events.len(),
            "fetched batch"
        );
        Ok(FetchedBatch { events, scanned_to, head })
    }

    /// Every event of `stream` from `from` through `until`, or through the
    /// current head when `until` is `None`. Stops scanning once past `until`.
    pub async fn fetch_until(
        &self,
        stream: &str,
        from: Sequence,
        until: Option<Sequence>,
        filter: &EventTypeFilter,
    ) -> Result<Vec<Event>, IndexerError> {
        let within = |seq: Sequence| until.map_or(true, |u| seq <= u);
        let mut out = Vec::new();
        let mut next = from;
        while within(next) {
            let batch = self.fetch_batch(stream, next, filter).await?;
            out.extend(batch.events.iter().filter(|e| within(e.sequence)).cloned());
            match batch.scanned_to {
                Some(scanned) if scanned < batch.head && within(scanned) => next = scanned.next(),
                _ => break,
            }
        }
        Ok(out)
    }

    /// Run one source call under the timeout + retry policy.
    ///
    /// `Pruned` surfaces as a `Gap` (the caller fills in the requested
    /// position); other non-retryable errors are not retried.
    async fn call<T, F, Fut>(&self, stream: &str, mut op: F) -> Result<T, IndexerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match tokio::time::timeout(self.timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(SourceError::Pruned { earliest })) => {
                    return Err(IndexerError::Gap {
                        stream: stream.to_string(),
                        requested: Sequence::GENESIS,
                        earliest,
                    })
                }
                Ok(Err(e)) if !e.is_retryable() => {
                    return Err(IndexerError::SourceUnavailable {
                        stream: stream.to_string(),
                        attempts: attempt,
                        reason: e.to_string(),
                    })
                }
                Ok(Err(e)) => e,
                Err(_) => SourceError::Timeout { ms: self.timeout.as_millis() as u64 },
            };

            match self.retry.next_delay(attempt) {
                Some(delay) => {
                    warn!(stream, attempt, ?delay, error = %err, "source call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(IndexerError::SourceUnavailable {
                        stream: stream.to_string(),
                        attempts: attempt,
                        reason: err.to_string(),
                    })
                }
            }
        }
    }
}
