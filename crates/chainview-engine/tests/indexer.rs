use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use chainview_core::cursor::{CursorStore, MemoryCursorStore};
use chainview_core::entity::{EntityDefinition, EntityState, IdField, ReduceError};
use chainview_core::error::{IndexerError, SourceError};
use chainview_core::indexer::TailState;
use chainview_core::query::{EventQuery, Op, QuerySpec, SortOrder};
use chainview_core::retry::RetryConfig;
use chainview_core::source::{EventSource, MemoryEventSource};
use chainview_core::store::{EntityStore, MemoryEntityStore};
use chainview_core::types::{Event, EventTypeFilter, Sequence};
use tokio::sync::{mpsc, Semaphore};
use chainview_core::value::Value;
use chainview_engine::{IndexerBuilder, StartFrom, TailEvent};

const STREAM: &str = "token";

fn transfer(block: u64, to: &str, amount: u64) -> Event {
    Event::new(Sequence::new(block, 0), "Transfer", "0xtoken")
        .with("to", Value::address(to))
        .with("amount", amount)
}

fn sum_amount(prior: Option<&EntityState>, event: &Event) -> Result<EntityState, ReduceError> {
    let mut state = prior.cloned().unwrap_or_default();
    let before = state.get("balance").and_then(Value::as_uint).unwrap_or(U256::ZERO);
    let delta = event
        .get("amount")
        .and_then(Value::as_uint)
        .ok_or_else(|| ReduceError::new("amount missing"))?;
    state.insert("balance".into(), Value::Uint(before + delta));
    Ok(state)
}

fn lenient_sum(prior: Option<&EntityState>, event: &Event) -> Result<EntityState, ReduceError> {
    let mut state = prior.cloned().unwrap_or_default();
    let before = state.get("balance").and_then(Value::as_uint).unwrap_or(U256::ZERO);
    let delta = event.get("amount").and_then(Value::as_uint).unwrap_or(U256::ZERO);
    state.insert("balance".into(), Value::Uint(before + delta));
    Ok(state)
}

fn doubled_sum(prior: Option<&EntityState>, event: &Event) -> Result<EntityState, ReduceError> {
    let mut state = prior.cloned().unwrap_or_default();
    let before = state.get("balance").and_then(Value::as_uint).unwrap_or(U256::ZERO);
    let delta = event.get("amount").and_then(Value::as_uint).unwrap_or(U256::ZERO);
    state.insert("balance".into(), Value::Uint(before + delta * U256::from(2u64)));
    Ok(state)
}

fn balances() -> EntityDefinition {
    EntityDefinition::new(IdField::field("to")).on("Transfer").reduce(sum_amount)
}

fn fast_retry() -> RetryConfig {
    RetryConfig { max_attempts: 3, initial_backoff_ms: 1, max_backoff_ms: 5, multiplier: 2.0 }
}

fn builder(source: Arc<MemoryEventSource>) -> IndexerBuilder {
    IndexerBuilder::new()
        .source(source)
        .retry(fast_retry())
        .fetch_timeout_ms(500)
        .poll_interval_ms(10)
        .live(false)
}

fn source_with(events: Vec<Event>) -> Arc<MemoryEventSource> {
    Arc::new(MemoryEventSource::with_events(STREAM, events).unwrap())
}

async fn balance_of(indexer: &chainview_engine::Indexer, id: &str) -> Option<U256> {
    indexer
        .get_entity("Balance", id)
        .await
        .unwrap()
        .and_then(|e| e.state.get("balance").and_then(Value::as_uint))
}

#[tokio::test]
async fn sums_transfers_per_recipient() {
    let source = source_with(vec![transfer(1, "0xA", 5), transfer(2, "0xB", 3), transfer(3, "0xA", 2)]);
    let indexer = builder(source).entity("Balance", balances()).build().unwrap();

    let handle = indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();
    assert!(!handle.live);
    assert_eq!(handle.report.head, Sequence::new(3, 0));

    assert_eq!(balance_of(&indexer, "0xA").await, Some(U256::from(7u64)));
    assert_eq!(balance_of(&indexer, "0xB").await, Some(U256::from(3u64)));
    assert_eq!(indexer.get_cursor(STREAM).await.unwrap(), Some(Sequence::new(3, 0)));
}

#[tokio::test]
async fn small_batches_give_the_same_result() {
    let events: Vec<Event> = (1..=20).map(|b| transfer(b, if b % 2 == 0 { "0xA" } else { "0xB" }, b)).collect();
    let source = source_with(events);
    let indexer = builder(source)
        .batch_size(3)
        .block_range(4)
        .entity("Balance", balances())
        .build()
        .unwrap();

    let handle = indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();
    assert!(handle.report.batches > 5);
    assert_eq!(handle.report.events, 20);
    // 2 + 4 + ... + 20
    assert_eq!(balance_of(&indexer, "0xA").await, Some(U256::from(110u64)));
    // 1 + 3 + ... + 19
    assert_eq!(balance_of(&indexer, "0xB").await, Some(U256::from(100u64)));
}

#[tokio::test]
async fn pruned_history_surfaces_a_gap() {
    let source = source_with((1..=5).map(|b| transfer(b, "0xA", 1)).collect());
    source.prune_before(STREAM, Sequence::new(3, 0)).unwrap();
    let indexer = builder(source).entity("Balance", balances()).build().unwrap();

    let err = indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap_err();
    assert!(err.is_gap(), "unexpected error: {err:?}");
    assert_eq!(indexer.get_cursor(STREAM).await.unwrap(), None);
    assert_eq!(balance_of(&indexer, "0xA").await, None);
    assert_eq!(indexer.state(STREAM), TailState::Failed);
    assert!(indexer.last_error(STREAM).is_some_and(|e| e.is_gap()));

    // an explicit start inside retained history works
    indexer.start_indexing(STREAM, StartFrom::At(Sequence::new(3, 0))).await.unwrap();
    assert_eq!(balance_of(&indexer, "0xA").await, Some(U256::from(3u64)));
}

#[tokio::test]
async fn second_start_is_rejected() {
    let source = source_with(vec![transfer(1, "0xA", 5)]);
    let indexer = builder(source).live(true).entity("Balance", balances()).build().unwrap();

    let (a, b) = tokio::join!(
        indexer.start_indexing(STREAM, StartFrom::Genesis),
        indexer.start_indexing(STREAM, StartFrom::Genesis),
    );
    let ok = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(ok, 1);
    let err = a.err().or(b.err()).unwrap();
    assert!(matches!(err, IndexerError::AlreadyIndexing { .. }));
    assert!(indexer.is_indexing(STREAM));

    indexer.stop_indexing(STREAM).await.unwrap();
    assert!(!indexer.is_indexing(STREAM));
    assert_eq!(indexer.state(STREAM), TailState::Stopped);

    // the guard is released once stopped
    indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();
    indexer.stop_indexing(STREAM).await.unwrap();
    assert_eq!(balance_of(&indexer, "0xA").await, Some(U256::from(5u64)));
}

#[tokio::test]
async fn reducer_failure_holds_the_cursor_before_the_bad_event() {
    let mut events: Vec<Event> = (1..=7).filter(|b| *b != 5).map(|b| transfer(b, "0xA", 1)).collect();
    events.push(Event::new(Sequence::new(5, 0), "Transfer", "0xtoken").with("to", Value::address("0xA")));
    let source = source_with(events);
    let indexer = builder(source).entity("Balance", balances()).build().unwrap();

    let err = indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap_err();
    let failed = err.failed_event().expect("reducer error carries the event");
    assert_eq!(failed.sequence, Sequence::new(5, 0));
    let cursor = indexer.get_cursor(STREAM).await.unwrap().unwrap();
    assert!(cursor < Sequence::new(5, 0));
    assert_eq!(balance_of(&indexer, "0xA").await, Some(U256::from(4u64)));

    // retrying without a fix fails on the same event
    let again = indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap_err();
    assert_eq!(again.failed_event().unwrap().sequence, Sequence::new(5, 0));

    // fixed reducer resumes from the cursor
    indexer
        .register_entity(
            "Balance",
            EntityDefinition::new(IdField::field("to")).on("Transfer").reduce(lenient_sum),
        )
        .unwrap();
    indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();
    assert_eq!(balance_of(&indexer, "0xA").await, Some(U256::from(6u64)));
    assert_eq!(indexer.get_cursor(STREAM).await.unwrap(), Some(Sequence::new(7, 0)));
}

#[tokio::test]
async fn lost_cursor_replay_does_not_double_count() {
    let source = source_with(vec![transfer(1, "0xA", 5), transfer(2, "0xB", 3), transfer(3, "0xA", 2)]);
    let entities = Arc::new(MemoryEntityStore::new());
    let cursors = Arc::new(MemoryCursorStore::new());

    let first = builder(source.clone())
        .entity_store(entities.clone())
        .cursor_store(cursors.clone())
        .entity("Balance", balances())
        .build()
        .unwrap();
    first.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();

    // entity writes landed but the cursor did not
    cursors.delete(STREAM).await.unwrap();

    let second = builder(source)
        .entity_store(entities.clone())
        .cursor_store(cursors)
        .entity("Balance", balances())
        .build()
        .unwrap();
    let handle = second.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();
    assert_eq!(handle.report.reduced, 0);
    assert_eq!(handle.report.skipped, 3);
    assert_eq!(balance_of(&second, "0xA").await, Some(U256::from(7u64)));
}

#[tokio::test]
async fn restart_resumes_after_the_cursor() {
    let source = source_with(vec![transfer(1, "0xA", 5)]);
    let indexer = builder(source.clone()).entity("Balance", balances()).build().unwrap();
    indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();

    source.append(STREAM, transfer(2, "0xA", 4)).unwrap();
    let handle = indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();
    assert_eq!(handle.report.events, 1);
    assert_eq!(handle.report.reduced, 1);
    assert_eq!(balance_of(&indexer, "0xA").await, Some(U256::from(9u64)));
}

fn nft(prior: Option<&EntityState>, event: &Event) -> Result<EntityState, ReduceError> {
    let mut state = prior.cloned().unwrap_or_default();
    if prior.is_none() {
        state.insert("mintedAt".into(), Value::Timestamp(event.observed_at));
    }
    let owner = event.get("to").cloned().ok_or_else(|| ReduceError::new("to missing"))?;
    state.insert("owner".into(), owner);
    Ok(state)
}

#[tokio::test]
async fn nft_owner_query_sorted_with_id_tiebreak() {
    // (tokenId, owner, mintedAt)
    let mints = [(1, "0xa", 100), (2, "0xb", 200), (3, "0xa", 300), (4, "0xc", 300), (5, "0xA", 300)];
    let mut events: Vec<Event> = mints
        .iter()
        .enumerate()
        .map(|(i, (id, owner, ts))| {
            Event::new(Sequence::new(i as u64 + 1, 0), "Transfer", "0xnft")
                .with("tokenId", *id as u64)
                .with("to", Value::address(*owner))
                .observed_at(*ts)
        })
        .collect();
    // token 2 moves to 0xa later; mintedAt stays
    events.push(
        Event::new(Sequence::new(9, 0), "Transfer", "0xnft")
            .with("tokenId", 2u64)
            .with("to", Value::address("0xa"))
            .observed_at(900),
    );

    let def = EntityDefinition::new(IdField::field("tokenId")).on("Transfer").reduce(nft);
    let indexer = builder(source_with(events)).entity("Token", def).build().unwrap();
    indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();

    let spec = QuerySpec::new()
        .where_eq("owner", Value::address("0xA"))
        .order_by("mintedAt", SortOrder::Desc)
        .limit(2);
    let page = indexer.query_entities("Token", &spec).await.unwrap();
    let ids: Vec<&str> = page.items.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, ["3", "5"]);
    assert!(page.next.is_some());

    // same query, same answer
    let again = indexer.query_entities("Token", &spec).await.unwrap();
    assert_eq!(again.items, page.items);

    let rest = indexer
        .query_entities("Token", &spec.clone().after(page.next.unwrap()))
        .await
        .unwrap();
    let ids: Vec<&str> = rest.items.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, ["2", "1"]);
}

#[tokio::test]
async fn unknown_entity_type_is_rejected() {
    let indexer = builder(source_with(vec![])).entity("Balance", balances()).build().unwrap();
    let err = indexer.query_entities("Nope", &QuerySpec::new()).await.unwrap_err();
    assert!(matches!(err, IndexerError::UnknownEntity(t) if t == "Nope"));
    assert!(indexer.get_entity("Nope", "x").await.is_err());
}

#[tokio::test]
async fn registration_without_events_is_a_config_error() {
    let indexer = builder(source_with(vec![])).build().unwrap();
    let def = EntityDefinition::new(IdField::field("to")).reduce(sum_amount);
    assert!(matches!(indexer.register_entity("Balance", def), Err(IndexerError::Config(_))));
}

#[tokio::test]
async fn live_tail_picks_up_new_events() {
    let source = source_with(vec![transfer(1, "0xA", 5)]);
    let indexer = builder(source.clone()).live(true).entity("Balance", balances()).build().unwrap();
    let mut status = indexer.subscribe_status();

    let handle = indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();
    assert!(handle.live);

    source.append(STREAM, transfer(2, "0xA", 10)).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while balance_of(&indexer, "0xA").await != Some(U256::from(15u64)) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("live tail applied the new event");
    assert_eq!(indexer.state(STREAM), TailState::Live);

    indexer.stop_indexing(STREAM).await.unwrap();
    assert_eq!(indexer.state(STREAM), TailState::Stopped);

    let mut saw_caught_up = false;
    let mut saw_stopped = false;
    while let Ok(event) = status.try_recv() {
        match event {
            TailEvent::CaughtUp { .. } => saw_caught_up = true,
            TailEvent::Stopped { .. } => saw_stopped = true,
            _ => {}
        }
    }
    assert!(saw_caught_up && saw_stopped);
}

#[tokio::test]
async fn live_tail_survives_a_source_outage() {
    let source = source_with(vec![transfer(1, "0xA", 1)]);
    let indexer = builder(source.clone()).live(true).entity("Balance", balances()).build().unwrap();
    indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();

    // more failures than one retry budget
    source.fail_next(5);
    source.append(STREAM, transfer(2, "0xA", 1)).unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while balance_of(&indexer, "0xA").await != Some(U256::from(2u64)) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("tail recovered after the outage");

    indexer.stop_indexing(STREAM).await.unwrap();
}

#[tokio::test]
async fn schema_change_forces_a_rebuild() {
    let source = source_with(vec![transfer(1, "0xA", 5), transfer(2, "0xA", 2)]);
    let entities = Arc::new(MemoryEntityStore::new());
    let cursors = Arc::new(MemoryCursorStore::new());

    let v1 = builder(source.clone())
        .entity_store(entities.clone())
        .cursor_store(cursors.clone())
        .entity("Balance", balances())
        .build()
        .unwrap();
    v1.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();
    assert_eq!(entities.schema_version("Balance").await.unwrap(), Some(1));

    let v2_def = EntityDefinition::new(IdField::field("to"))
        .on("Transfer")
        .version(2)
        .reduce(doubled_sum);
    let v2 = builder(source)
        .entity_store(entities.clone())
        .cursor_store(cursors)
        .entity("Balance", v2_def)
        .build()
        .unwrap();
    v2.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();

    assert_eq!(balance_of(&v2, "0xA").await, Some(U256::from(14u64)));
    assert_eq!(entities.schema_version("Balance").await.unwrap(), Some(2));
}

#[tokio::test]
async fn reset_cursor_rebuilds_from_scratch() {
    let source = source_with(vec![transfer(1, "0xA", 5), transfer(2, "0xA", 2)]);
    let indexer = builder(source).entity("Balance", balances()).build().unwrap();
    indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();

    indexer.reset_cursor(STREAM).await.unwrap();
    assert_eq!(indexer.get_cursor(STREAM).await.unwrap(), None);
    assert_eq!(balance_of(&indexer, "0xA").await, None);

    indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();
    assert_eq!(balance_of(&indexer, "0xA").await, Some(U256::from(7u64)));
}

#[tokio::test]
async fn reset_is_refused_while_indexing() {
    let source = source_with(vec![transfer(1, "0xA", 5)]);
    let indexer = builder(source).live(true).entity("Balance", balances()).build().unwrap();
    indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();

    let err = indexer.reset_cursor(STREAM).await.unwrap_err();
    assert!(matches!(err, IndexerError::AlreadyIndexing { .. }));

    indexer.stop_indexing(STREAM).await.unwrap();
    indexer.reset_cursor(STREAM).await.unwrap();
}

#[tokio::test]
async fn transient_failures_during_catch_up_are_retried() {
    let source = source_with(vec![transfer(1, "0xA", 5)]);
    source.fail_next(2);
    let indexer = builder(source).entity("Balance", balances()).build().unwrap();
    indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();
    assert_eq!(balance_of(&indexer, "0xA").await, Some(U256::from(5u64)));
}

#[tokio::test]
async fn exhausted_retries_fail_without_moving_the_cursor() {
    let source = source_with(vec![transfer(1, "0xA", 5)]);
    source.fail_next(100);
    let indexer = builder(source).entity("Balance", balances()).build().unwrap();
    let err = indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(indexer.get_cursor(STREAM).await.unwrap(), None);
}

#[tokio::test]
async fn raw_event_queries() {
    let source = source_with(vec![
        transfer(1, "0xA", 5),
        Event::new(Sequence::new(2, 0), "Approval", "0xtoken").with("spender", Value::address("0xA")),
        transfer(3, "0xB", 3),
        transfer(4, "0xA", 9),
    ]);
    let indexer = builder(source).build().unwrap();

    let query = EventQuery::of_type("Transfer").filter("amount", Op::Gt, 4u64).limit(10);
    let events = indexer.query_events(STREAM, &query).await.unwrap();
    let seqs: Vec<Sequence> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(seqs, [Sequence::new(1, 0), Sequence::new(4, 0)]);

    let all = indexer.query_events(STREAM, &EventQuery::default()).await.unwrap();
    assert_eq!(all.len(), 4);
}

#[tokio::test]
async fn catch_up_only_leaves_the_stream_idle() {
    let source = source_with(vec![transfer(1, "0xA", 5)]);
    let indexer = builder(source).live(true).entity("Balance", balances()).build().unwrap();
    let report = indexer.catch_up(STREAM, StartFrom::Genesis).await.unwrap();
    assert_eq!(report.events, 1);
    assert_eq!(report.cursor, Some(Sequence::new(1, 0)));
    assert!(!indexer.is_indexing(STREAM));
    assert_eq!(indexer.state(STREAM), TailState::Idle);
}

// ─── Cancellation, parallel streams, shared entities ─────────────────────────

/// Wraps a memory source. Range fetches starting at or above `gate_from`
/// report their start on `entered` and wait until [`GatedSource::open`];
/// the head is capped at `visible_through` (a block number).
struct GatedSource {
    inner: Arc<MemoryEventSource>,
    gate_from: AtomicU64,
    visible_through: AtomicU64,
    permits: Semaphore,
    entered: mpsc::UnboundedSender<Sequence>,
}

impl GatedSource {
    fn new(inner: Arc<MemoryEventSource>, gate_from: u64) -> (Arc<Self>, mpsc::UnboundedReceiver<Sequence>) {
        let (entered, rx) = mpsc::unbounded_channel();
        let source = GatedSource {
            inner,
            gate_from: AtomicU64::new(gate_from),
            visible_through: AtomicU64::new(u64::MAX),
            permits: Semaphore::new(0),
            entered,
        };
        (Arc::new(source), rx)
    }

    fn open(&self) {
        self.permits.add_permits(1_000);
    }
}

#[async_trait]
impl EventSource for GatedSource {
    async fn head(&self, stream: &str) -> Result<Sequence, SourceError> {
        let head = self.inner.head(stream).await?;
        Ok(head.min(Sequence::end_of_block(self.visible_through.load(Ordering::SeqCst))))
    }

    async fn fetch_range(
        &self,
        stream: &str,
        from: Sequence,
        to: Sequence,
        filter: &EventTypeFilter,
    ) -> Result<Vec<Event>, SourceError> {
        if from.block_number >= self.gate_from.load(Ordering::SeqCst) {
            let _ = self.entered.send(from);
            self.permits
                .acquire()
                .await
                .map_err(|e| SourceError::Other(e.to_string()))?
                .forget();
        }
        self.inner.fetch_range(stream, from, to, filter).await
    }
}

fn gated_builder(source: Arc<GatedSource>) -> IndexerBuilder {
    IndexerBuilder::new()
        .source(source)
        .retry(fast_retry())
        .fetch_timeout_ms(5_000)
        .poll_interval_ms(10)
        .block_range(1)
        .entity("Balance", balances())
}

#[tokio::test]
async fn stop_during_catch_up_cancels_at_a_batch_boundary() {
    let inner = source_with((1..=5).map(|b| transfer(b, "0xA", 1)).collect());
    let (source, mut entered) = GatedSource::new(inner, 1);
    let indexer = gated_builder(source.clone()).live(true).build().unwrap();

    let runner = indexer.clone();
    let start = tokio::spawn(async move { runner.start_indexing(STREAM, StartFrom::Genesis).await });

    assert_eq!(entered.recv().await, Some(Sequence::new(1, 0)));
    indexer.stop_indexing(STREAM).await.unwrap();
    source.open();

    let err = start.await.unwrap().unwrap_err();
    assert!(matches!(err, IndexerError::Cancelled { .. }), "unexpected error: {err:?}");
    assert_eq!(indexer.state(STREAM), TailState::Stopped);
    assert!(!indexer.is_indexing(STREAM));
    // the in-flight batch (block 1) completed, nothing after it
    assert_eq!(indexer.get_cursor(STREAM).await.unwrap(), Some(Sequence::end_of_block(1)));
    assert_eq!(balance_of(&indexer, "0xA").await, Some(U256::from(1u64)));

    // resumes from the batch boundary
    let report = indexer.catch_up(STREAM, StartFrom::Genesis).await.unwrap();
    assert_eq!(report.events, 4);
    assert_eq!(balance_of(&indexer, "0xA").await, Some(U256::from(5u64)));
}

#[tokio::test]
async fn stop_during_a_live_backlog_cancels_at_a_batch_boundary() {
    let inner = source_with((1..=2).map(|b| transfer(b, "0xA", 1)).collect());
    let (source, mut entered) = GatedSource::new(inner.clone(), u64::MAX);
    let indexer = gated_builder(source.clone()).live(true).build().unwrap();
    indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();
    assert_eq!(balance_of(&indexer, "0xA").await, Some(U256::from(2u64)));

    // a backlog of four blocks becomes visible at once
    source.visible_through.store(2, Ordering::SeqCst);
    for b in 3..=6 {
        inner.append(STREAM, transfer(b, "0xA", 1)).unwrap();
    }
    source.gate_from.store(3, Ordering::SeqCst);
    source.visible_through.store(u64::MAX, Ordering::SeqCst);

    assert_eq!(entered.recv().await, Some(Sequence::new(3, 0)));
    let stop = indexer.stop_indexing(STREAM);
    tokio::pin!(stop);
    assert!(futures::poll!(&mut stop).is_pending());
    source.open();
    tokio::time::timeout(Duration::from_secs(5), stop)
        .await
        .expect("live task stopped")
        .unwrap();

    assert_eq!(indexer.state(STREAM), TailState::Stopped);
    assert_eq!(indexer.get_cursor(STREAM).await.unwrap(), Some(Sequence::end_of_block(3)));
    assert_eq!(balance_of(&indexer, "0xA").await, Some(U256::from(3u64)));
}

#[tokio::test]
async fn distinct_streams_index_in_parallel() {
    let source = Arc::new(MemoryEventSource::new());
    for b in 1..=10 {
        source.append("tokA", transfer(b, "0xA", 1)).unwrap();
        source.append("tokB", transfer(b, "0xB", 2)).unwrap();
    }
    let indexer = builder(source.clone())
        .batch_size(2)
        .live(true)
        .entity("Balance", balances())
        .build()
        .unwrap();

    let (a, b) = tokio::join!(
        indexer.start_indexing("tokA", StartFrom::Genesis),
        indexer.start_indexing("tokB", StartFrom::Genesis),
    );
    assert!(a.unwrap().live && b.unwrap().live);
    assert!(indexer.is_indexing("tokA") && indexer.is_indexing("tokB"));
    assert_eq!(balance_of(&indexer, "0xA").await, Some(U256::from(10u64)));
    assert_eq!(balance_of(&indexer, "0xB").await, Some(U256::from(20u64)));

    source.append("tokA", transfer(11, "0xA", 1)).unwrap();
    source.append("tokB", transfer(11, "0xB", 2)).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while balance_of(&indexer, "0xA").await != Some(U256::from(11u64))
            || balance_of(&indexer, "0xB").await != Some(U256::from(22u64))
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("both live tails applied their events");

    indexer.stop_indexing("tokA").await.unwrap();
    assert!(indexer.is_indexing("tokB"));
    indexer.stop_indexing("tokB").await.unwrap();
    assert_eq!(indexer.get_cursor("tokA").await.unwrap(), Some(Sequence::new(11, 0)));
    assert_eq!(indexer.get_cursor("tokB").await.unwrap(), Some(Sequence::new(11, 0)));
}

fn two_stream_source() -> Arc<MemoryEventSource> {
    let source = Arc::new(MemoryEventSource::new());
    source.append("tokA", transfer(1, "0xU", 5)).unwrap();
    source.append("tokA", transfer(2, "0xV", 7)).unwrap();
    source.append("tokB", transfer(1, "0xU", 100)).unwrap();
    source.append("tokB", transfer(2, "0xW", 9)).unwrap();
    source
}

#[tokio::test]
async fn reset_rebuilds_entities_shared_with_other_streams() {
    let indexer = builder(two_stream_source()).entity("Balance", balances()).build().unwrap();
    indexer.start_indexing("tokA", StartFrom::Genesis).await.unwrap();
    indexer.start_indexing("tokB", StartFrom::Genesis).await.unwrap();
    assert_eq!(balance_of(&indexer, "0xU").await, Some(U256::from(105u64)));

    indexer.reset_cursor("tokA").await.unwrap();
    assert_eq!(indexer.get_cursor("tokA").await.unwrap(), None);
    // tokB fed a purged entity, so it replays too
    assert_eq!(indexer.get_cursor("tokB").await.unwrap(), None);
    assert_eq!(balance_of(&indexer, "0xU").await, None);
    assert_eq!(balance_of(&indexer, "0xV").await, None);
    assert_eq!(balance_of(&indexer, "0xW").await, Some(U256::from(9u64)));

    indexer.start_indexing("tokA", StartFrom::Genesis).await.unwrap();
    indexer.start_indexing("tokB", StartFrom::Genesis).await.unwrap();
    assert_eq!(balance_of(&indexer, "0xU").await, Some(U256::from(105u64)));
    assert_eq!(balance_of(&indexer, "0xV").await, Some(U256::from(7u64)));
    // untouched by the purge and not folded twice
    assert_eq!(balance_of(&indexer, "0xW").await, Some(U256::from(9u64)));
}

#[tokio::test]
async fn reset_is_refused_while_a_sharing_stream_is_indexing() {
    let indexer = builder(two_stream_source()).live(true).entity("Balance", balances()).build().unwrap();
    indexer.start_indexing("tokA", StartFrom::Genesis).await.unwrap();
    indexer.stop_indexing("tokA").await.unwrap();
    indexer.start_indexing("tokB", StartFrom::Genesis).await.unwrap();

    let err = indexer.reset_cursor("tokA").await.unwrap_err();
    match err {
        IndexerError::AlreadyIndexing { stream } => assert_eq!(stream, "tokB"),
        other => panic!("unexpected error: {other:?}"),
    }
    // nothing was touched
    assert_eq!(indexer.get_cursor("tokA").await.unwrap(), Some(Sequence::new(2, 0)));
    assert_eq!(balance_of(&indexer, "0xU").await, Some(U256::from(105u64)));
    assert!(!indexer.is_indexing("tokA"));

    indexer.stop_indexing("tokB").await.unwrap();
    indexer.reset_cursor("tokA").await.unwrap();
    assert_eq!(indexer.get_cursor("tokB").await.unwrap(), None);
}

#[tokio::test]
async fn rapid_restarts_keep_each_task_in_its_own_slot() {
    let source = source_with(vec![transfer(1, "0xA", 5)]);
    let indexer = builder(source).live(true).entity("Balance", balances()).build().unwrap();
    for _ in 0..5 {
        let handle = indexer.start_indexing(STREAM, StartFrom::Genesis).await.unwrap();
        assert!(handle.live);
        indexer.stop_indexing(STREAM).await.unwrap();
        assert_eq!(indexer.state(STREAM), TailState::Stopped);
        assert!(!indexer.is_indexing(STREAM));
    }
    assert_eq!(balance_of(&indexer, "0xA").await, Some(U256::from(5u64)));
}

#[tokio::test]
async fn raw_event_queries_are_bounded_and_skip_pruned_history() {
    let source = source_with((1..=6).map(|b| transfer(b, "0xA", b)).collect());
    source.prune_before(STREAM, Sequence::new(3, 0)).unwrap();
    let indexer = builder(source).build().unwrap();

    let retained = indexer.query_events(STREAM, &EventQuery::default()).await.unwrap();
    let blocks: Vec<u64> = retained.iter().map(|e| e.sequence.block_number).collect();
    assert_eq!(blocks, [3, 4, 5, 6]);

    let bounded = EventQuery { to: Some(Sequence::new(4, 0)), ..EventQuery::default() };
    let blocks: Vec<u64> = indexer
        .query_events(STREAM, &bounded)
        .await
        .unwrap()
        .iter()
        .map(|e| e.sequence.block_number)
        .collect();
    assert_eq!(blocks, [3, 4]);

    // an explicit start below retained history is still a gap
    let explicit = EventQuery { from: Some(Sequence::new(1, 0)), ..EventQuery::default() };
    assert!(indexer.query_events(STREAM, &explicit).await.unwrap_err().is_gap());
}
