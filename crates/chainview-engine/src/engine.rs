//! The embeddable indexer: entity registration, per-stream indexing, queries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chainview_core::cursor::CursorManager;
use chainview_core::entity::{Entity, EntityDefinition, EntityRegistry};
use chainview_core::error::IndexerError;
use chainview_core::fetcher::LogFetcher;
use chainview_core::indexer::{IndexerConfig, TailState};
use chainview_core::projector::Projector;
use chainview_core::query::{evaluate_events, EventQuery, QueryPage, QuerySpec};
use chainview_core::types::{Event, EventTypeFilter, Sequence};

use crate::tail;

/// Where a stream starts when it has no stored cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartFrom {
    Genesis,
    At(Sequence),
}

impl StartFrom {
    pub fn sequence(self) -> Sequence {
        match self {
            StartFrom::Genesis => Sequence::GENESIS,
            StartFrom::At(seq) => seq,
        }
    }
}

/// Status notifications emitted by the consumption loops.
#[derive(Debug, Clone)]
pub enum TailEvent {
    BatchApplied {
        stream: String,
        events: usize,
        cursor: Option<Sequence>,
        head: Sequence,
    },
    CaughtUp {
        stream: String,
        cursor: Option<Sequence>,
        head: Sequence,
    },
    EnteredLive { stream: String },
    FellBack { stream: String, reason: String },
    Stopped { stream: String },
    Failed { stream: String, error: IndexerError },
}

/// Summary of a catch-up pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatchUpReport {
    pub batches: usize,
    pub events: usize,
    pub reduced: usize,
    pub skipped: usize,
    /// Cursor after the pass.
    pub cursor: Option<Sequence>,
    /// Head the pass converged on.
    pub head: Sequence,
}

/// Returned by [`Indexer::start_indexing`] once the initial catch-up is done.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub stream: String,
    pub report: CatchUpReport,
    /// `true` if a live tail task keeps the stream fresh.
    pub live: bool,
}

pub(crate) struct StreamSlot {
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<Result<(), IndexerError>>>,
}

#[derive(Default)]
struct StreamStatus {
    state: Option<TailState>,
    last_error: Option<IndexerError>,
}

pub(crate) struct Shared {
    pub(crate) config: IndexerConfig,
    pub(crate) fetcher: LogFetcher,
    pub(crate) projector: Projector,
    pub(crate) cursors: CursorManager,
    registry: RwLock<Arc<EntityRegistry>>,
    active: Mutex<HashMap<String, StreamSlot>>,
    states: Mutex<HashMap<String, StreamStatus>>,
    status: broadcast::Sender<TailEvent>,
}

impl Shared {
    pub(crate) fn registry(&self) -> Arc<EntityRegistry> {
        match self.registry.read() {
            Ok(r) => Arc::clone(&*r),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Source filter: configured types, else everything some entity uses.
    pub(crate) fn filter(&self) -> EventTypeFilter {
        if !self.config.event_types.event_types.is_empty() {
            return self.config.event_types.clone();
        }
        EventTypeFilter::only(self.registry().event_types())
    }

    pub(crate) fn set_state(&self, stream: &str, state: TailState) {
        let mut states = lock(&self.states);
        let status = states.entry(stream.to_string()).or_default();
        status.state = Some(state);
        if state != TailState::Failed {
            status.last_error = None;
        }
    }

    pub(crate) fn fail(&self, stream: &str, err: &IndexerError) {
        let mut states = lock(&self.states);
        let status = states.entry(stream.to_string()).or_default();
        status.state = Some(TailState::Failed);
        status.last_error = Some(err.clone());
    }

    pub(crate) fn emit(&self, event: TailEvent) {
        // no subscribers is fine
        let _ = self.status.send(event);
    }

    fn is_active(&self, stream: &str) -> bool {
        lock(&self.active).contains_key(stream)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive right to index one stream. Released on drop.
pub(crate) struct StreamLease {
    shared: Arc<Shared>,
    stream: String,
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        lock(&self.shared.active).remove(&self.stream);
    }
}

/// Event-log indexer: folds one or more streams into queryable entities.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Indexer {
    shared: Arc<Shared>,
}

impl Indexer {
    pub(crate) fn from_parts(
        config: IndexerConfig,
        fetcher: LogFetcher,
        projector: Projector,
        cursors: CursorManager,
        registry: EntityRegistry,
    ) -> Self {
        let (status, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                config,
                fetcher,
                projector,
                cursors,
                registry: RwLock::new(Arc::new(registry)),
                active: Mutex::new(HashMap::new()),
                states: Mutex::new(HashMap::new()),
                status,
            }),
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.shared.config
    }

    // ─── Registration ────────────────────────────────────────────────────────

    /// Register (or replace) an entity type. Running streams pick the new
    /// definition up at their next batch.
    pub fn register_entity(
        &self,
        entity_type: impl Into<String>,
        definition: EntityDefinition,
    ) -> Result<(), IndexerError> {
        let entity_type = entity_type.into();
        if definition.subscribed_events.is_empty() {
            return Err(IndexerError::Config(format!(
                "entity '{entity_type}' subscribes to no events"
            )));
        }
        let mut guard = self
            .shared
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = EntityRegistry::clone(&guard);
        if next.register(entity_type.clone(), definition).is_some() {
            info!(entity_type, "entity definition replaced");
        }
        *guard = Arc::new(next);
        Ok(())
    }

    // ─── Indexing ────────────────────────────────────────────────────────────

    /// Index `stream`: catch up to the source head (inline, errors returned
    /// directly), then hand over to a live tail task when `config.live`.
    ///
    /// Resumes from the stored cursor when there is one; `from` only matters
    /// when it lies beyond it. Fails immediately with
    /// [`IndexerError::AlreadyIndexing`] if the stream is already active.
    pub async fn start_indexing(&self, stream: &str, from: StartFrom) -> Result<StreamHandle, IndexerError> {
        let (lease, mut cancel) = self.acquire(stream)?;
        self.reconcile_schemas(stream).await?;

        let start = from.sequence();
        self.shared.set_state(stream, TailState::CatchingUp);
        let report = match tail::catch_up(&self.shared, stream, start, &mut cancel).await {
            Ok(report) => report,
            Err(e) => {
                if matches!(e, IndexerError::Cancelled { .. }) {
                    self.shared.set_state(stream, TailState::Stopped);
                } else {
                    self.shared.fail(stream, &e);
                }
                return Err(e);
            }
        };

        if !self.shared.config.live {
            self.shared.set_state(stream, TailState::Stopped);
            return Ok(StreamHandle { stream: stream.to_string(), report, live: false });
        }

        let shared = Arc::clone(&self.shared);
        let key = stream.to_string();
        // The task releases its lease through `active`; holding the lock
        // until the handle is stored keeps it in this stream's slot.
        let mut active = lock(&self.shared.active);
        let task = tokio::spawn(async move { tail::run_live(shared, key, start, lease, cancel).await });
        if let Some(slot) = active.get_mut(stream) {
            slot.task = Some(task);
        }
        drop(active);
        Ok(StreamHandle { stream: stream.to_string(), report, live: true })
    }

    /// One bounded catch-up pass, without live tailing.
    pub async fn catch_up(&self, stream: &str, from: StartFrom) -> Result<CatchUpReport, IndexerError> {
        let (_lease, mut cancel) = self.acquire(stream)?;
        self.reconcile_schemas(stream).await?;
        self.shared.set_state(stream, TailState::CatchingUp);
        let result = tail::catch_up(&self.shared, stream, from.sequence(), &mut cancel).await;
        match &result {
            Ok(_) => self.shared.set_state(stream, TailState::Idle),
            Err(e) => self.shared.fail(stream, e),
        }
        result
    }

    /// Ask the stream's loop to stop at the next batch boundary and wait for
    /// the live task to exit. Returns the task's terminal error, if any.
    pub async fn stop_indexing(&self, stream: &str) -> Result<(), IndexerError> {
        let task = {
            let mut active = lock(&self.shared.active);
            match active.get_mut(stream) {
                Some(slot) => {
                    let _ = slot.cancel.send(true);
                    slot.task.take()
                }
                None => None,
            }
        };
        match task {
            Some(task) => task.await.unwrap_or_else(|_| {
                Err(IndexerError::Cancelled { stream: stream.to_string() })
            }),
            None => Ok(()),
        }
    }

    /// Wait for the live task of `stream` to end on its own.
    pub async fn wait(&self, stream: &str) -> Result<(), IndexerError> {
        let task = lock(&self.shared.active).get_mut(stream).and_then(|s| s.task.take());
        match task {
            Some(task) => task.await.unwrap_or_else(|_| {
                Err(IndexerError::Cancelled { stream: stream.to_string() })
            }),
            None => Ok(()),
        }
    }

    pub fn state(&self, stream: &str) -> TailState {
        lock(&self.shared.states)
            .get(stream)
            .and_then(|s| s.state)
            .unwrap_or(TailState::Idle)
    }

    /// The error that put `stream` into [`TailState::Failed`], if it is there.
    pub fn last_error(&self, stream: &str) -> Option<IndexerError> {
        lock(&self.shared.states).get(stream).and_then(|s| s.last_error.clone())
    }

    pub fn is_indexing(&self, stream: &str) -> bool {
        self.shared.is_active(stream)
    }

    /// Subscribe to [`TailEvent`] notifications.
    pub fn subscribe_status(&self) -> broadcast::Receiver<TailEvent> {
        self.shared.status.subscribe()
    }

    // ─── Cursors ─────────────────────────────────────────────────────────────

    pub async fn get_cursor(&self, stream: &str) -> Result<Option<Sequence>, IndexerError> {
        self.shared.cursors.get(stream).await
    }

    /// Clear the stream's cursor and drop the projections it fed, so the next
    /// `start_indexing(.., Genesis)` rebuilds them.
    ///
    /// Entities that other streams also fed are dropped too, so those
    /// streams' cursors are cleared as well and their next run replays
    /// into the rebuilt entities; entities only they fed skip the replay
    /// through their watermarks. Rejected while `stream` or any stream
    /// sharing an entity with it is being indexed.
    pub async fn reset_cursor(&self, stream: &str) -> Result<(), IndexerError> {
        let mut leases = vec![self.acquire(stream)?];
        let store = self.shared.projector.store();

        let sharing = store.streams_sharing(stream).await?;
        let others: Vec<&String> = sharing.iter().filter(|s| s.as_str() != stream).collect();
        for other in &others {
            leases.push(self.acquire(other)?);
        }

        let purged = store.purge_stream(stream).await?;
        self.shared.cursors.reset(stream).await?;
        self.shared.set_state(stream, TailState::Idle);
        for other in &others {
            self.shared.cursors.reset(other).await?;
            self.shared.set_state(other, TailState::Idle);
        }
        info!(stream, purged, also_reset = ?others, "stream reset for re-indexing");
        drop(leases);
        Ok(())
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    /// Query the materialized projection of `entity_type`.
    pub async fn query_entities(&self, entity_type: &str, spec: &QuerySpec) -> Result<QueryPage, IndexerError> {
        self.ensure_registered(entity_type)?;
        self.shared.projector.store().query(entity_type, spec).await
    }

    pub async fn get_entity(&self, entity_type: &str, id: &str) -> Result<Option<Entity>, IndexerError> {
        self.ensure_registered(entity_type)?;
        self.shared.projector.store().get(entity_type, id).await
    }

    /// Query raw events straight from the source. Scans the requested range
    /// on every call; prefer a registered projection for anything hot.
    ///
    /// Without `query.from` the scan starts at the oldest event the source
    /// still retains. The scan ends at `query.to`, or at the head.
    pub async fn query_events(&self, stream: &str, query: &EventQuery) -> Result<Vec<Event>, IndexerError> {
        let filter = match &query.event_type {
            Some(t) => EventTypeFilter::only([t.clone()]),
            None => EventTypeFilter::all(),
        };
        let fetcher = &self.shared.fetcher;
        let from = query.from.unwrap_or(Sequence::GENESIS);
        let events = match fetcher.fetch_until(stream, from, query.to, &filter).await {
            Err(IndexerError::Gap { earliest, .. }) if query.from.is_none() => {
                debug!(stream, %earliest, "history pruned, querying retained events");
                fetcher.fetch_until(stream, earliest, query.to, &filter).await?
            }
            result => result?,
        };
        Ok(evaluate_events(events, query))
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    fn ensure_registered(&self, entity_type: &str) -> Result<(), IndexerError> {
        if self.shared.registry().contains(entity_type) {
            Ok(())
        } else {
            Err(IndexerError::UnknownEntity(entity_type.to_string()))
        }
    }

    fn acquire(&self, stream: &str) -> Result<(StreamLease, watch::Receiver<bool>), IndexerError> {
        let mut active = lock(&self.shared.active);
        if active.contains_key(stream) {
            return Err(IndexerError::AlreadyIndexing { stream: stream.to_string() });
        }
        let (cancel, rx) = watch::channel(false);
        active.insert(stream.to_string(), StreamSlot { cancel, task: None });
        Ok((
            StreamLease { shared: Arc::clone(&self.shared), stream: stream.to_string() },
            rx,
        ))
    }

    /// Compare registered schema versions with the persisted tags. A changed
    /// entity type is wiped and every cursor reset, forcing a full replay;
    /// entity watermarks keep the replay a no-op for unchanged types.
    async fn reconcile_schemas(&self, stream: &str) -> Result<(), IndexerError> {
        let registry = self.shared.registry();
        let store = self.shared.projector.store();

        let mut stale = Vec::new();
        for (entity_type, definition) in registry.iter() {
            match store.schema_version(entity_type).await? {
                Some(stored) if stored != definition.schema_version => {
                    stale.push((entity_type.to_string(), stored, definition.schema_version));
                }
                Some(_) => {}
                None => store.set_schema_version(entity_type, definition.schema_version).await?,
            }
        }
        let Some((first_type, stored, registered)) = stale.first().cloned() else {
            return Ok(());
        };

        let others_active = lock(&self.shared.active).keys().any(|k| k != stream);
        if others_active {
            return Err(IndexerError::SchemaMismatch { entity_type: first_type, stored, registered });
        }

        for (entity_type, stored, registered) in &stale {
            warn!(entity_type, stored, registered, "schema changed, re-indexing");
            store.clear(entity_type).await?;
            store.set_schema_version(entity_type, *registered).await?;
        }
        for record in self.shared.cursors.list().await? {
            self.shared.cursors.reset(&record.stream_key).await?;
        }
        Ok(())
    }
}
