//! Event sources: the append-only logs the engine consumes.
//!
//! The engine only reads. A source reports its head, serves ordered ranges,
//! and may push notifications when new events land.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::broadcast;

use crate::error::SourceError;
use crate::types::{Event, EventTypeFilter, Sequence};

/// Wake-up notifications from a push-capable source. Each item carries the
/// sequence of a newly appended event; the consumer re-fetches from its own
/// cursor rather than trusting the notification to be gap-free.
pub type Notifications = BoxStream<'static, Result<Sequence, SourceError>>;

/// An append-only, totally ordered event log.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Every position at or below the head is final.
    async fn head(&self, stream: &str) -> Result<Sequence, SourceError>;

    /// Events of `stream` with `from <= sequence <= to` that pass `filter`,
    /// in ascending sequence order.
    ///
    /// Fails with [`SourceError::Pruned`] if `from` predates retained history.
    async fn fetch_range(
        &self,
        stream: &str,
        from: Sequence,
        to: Sequence,
        filter: &EventTypeFilter,
    ) -> Result<Vec<Event>, SourceError>;

    /// Push notifications for new events. `None` means the source can only be
    /// polled.
    async fn subscribe(
        &self,
        _stream: &str,
        _filter: &EventTypeFilter,
    ) -> Result<Option<Notifications>, SourceError> {
        Ok(None)
    }
}

// ─── In-memory source ────────────────────────────────────────────────────────

#[derive(Default)]
struct StreamLog {
    events: Vec<Event>,
    head: Sequence,
    earliest: Sequence,
}

/// In-process event source.
///
/// Used by tests, by the CLI (loaded from an event file) and by embedders that
/// already hold decoded events. Block 0 is treated as the genesis block and
/// never carries events, so the first appended event must sit above `0:0`.
pub struct MemoryEventSource {
    streams: RwLock<HashMap<String, StreamLog>>,
    notify: broadcast::Sender<(String, String, Sequence)>,
    failures: AtomicU32,
}

impl Default for MemoryEventSource {
    fn default() -> Self {
        let (notify, _) = broadcast::channel(1_024);
        Self {
            streams: RwLock::new(HashMap::new()),
            notify,
            failures: AtomicU32::new(0),
        }
    }
}

impl MemoryEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a source holding `events` (sorted on the way in) for `stream`.
    pub fn with_events(stream: &str, mut events: Vec<Event>) -> Result<Self, SourceError> {
        events.sort_by_key(|e| e.sequence);
        let source = Self::new();
        for event in events {
            source.append(stream, event)?;
        }
        Ok(source)
    }

    /// Append an event. Sequences must strictly increase per stream.
    pub fn append(&self, stream: &str, event: Event) -> Result<(), SourceError> {
        let mut streams = self.write()?;
        let log = streams.entry(stream.to_string()).or_default();
        if event.sequence <= log.head {
            return Err(SourceError::Other(format!(
                "sequence {} is not above head {} of stream '{stream}'",
                event.sequence, log.head
            )));
        }
        log.head = event.sequence;
        let notification = (stream.to_string(), event.event_type.clone(), event.sequence);
        log.events.push(event);
        drop(streams);
        // no subscribers is fine
        let _ = self.notify.send(notification);
        Ok(())
    }

    /// Move the head forward without appending (blocks with no events).
    pub fn advance_head(&self, stream: &str, head: Sequence) -> Result<(), SourceError> {
        let mut streams = self.write()?;
        let log = streams.entry(stream.to_string()).or_default();
        log.head = log.head.max(head);
        Ok(())
    }

    /// Drop history before `earliest`; fetches below it fail with `Pruned`.
    pub fn prune_before(&self, stream: &str, earliest: Sequence) -> Result<(), SourceError> {
        let mut streams = self.write()?;
        let log = streams.entry(stream.to_string()).or_default();
        log.events.retain(|e| e.sequence >= earliest);
        log.earliest = log.earliest.max(earliest);
        Ok(())
    }

    /// Make the next `n` calls fail with [`SourceError::Unavailable`].
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Result<(), SourceError> {
        let hit = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            return Err(SourceError::Unavailable("injected outage".into()));
        }
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, StreamLog>>, SourceError> {
        self.streams
            .read()
            .map_err(|_| SourceError::Other("source lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, StreamLog>>, SourceError> {
        self.streams
            .write()
            .map_err(|_| SourceError::Other("source lock poisoned".into()))
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn head(&self, stream: &str) -> Result<Sequence, SourceError> {
        self.injected_failure()?;
        Ok(self.read()?.get(stream).map(|l| l.head).unwrap_or(Sequence::GENESIS))
    }

    async fn fetch_range(
        &self,
        stream: &str,
        from: Sequence,
        to: Sequence,
        filter: &EventTypeFilter,
    ) -> Result<Vec<Event>, SourceError> {
        self.injected_failure()?;
        let streams = self.read()?;
        let Some(log) = streams.get(stream) else {
            return Ok(vec![]);
        };
        if from < log.earliest {
            return Err(SourceError::Pruned { earliest: log.earliest });
        }
        let start = log.events.partition_point(|e| e.sequence < from);
        Ok(log.events[start..]
            .iter()
            .take_while(|e| e.sequence <= to)
            .filter(|e| filter.matches(&e.event_type))
            .cloned()
            .collect())
    }

    async fn subscribe(
        &self,
        stream: &str,
        filter: &EventTypeFilter,
    ) -> Result<Option<Notifications>, SourceError> {
        let rx = self.notify.subscribe();
        let key = stream.to_string();
        let filter = filter.clone();
        let notifications = futures::stream::unfold(rx, move |mut rx| {
            let key = key.clone();
            let filter = filter.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((s, event_type, seq)) if s == key && filter.matches(&event_type) => {
                            return Some((Ok(seq), rx));
                        }
                        Ok(_) => continue,
                        // a missed wake-up is covered by the next fetch from the cursor
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(Some(notifications.boxed()))
    }
}
