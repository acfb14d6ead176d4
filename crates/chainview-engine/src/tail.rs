//! Consumption loops: bounded catch-up and the live tail.
//!
//! Both drive the same fetch → project → advance-cursor cycle. Live mode only
//! changes what triggers a cycle: a source notification, or the poll interval
//! when the source cannot push.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use chainview_core::error::IndexerError;
use chainview_core::fetcher::FetchedBatch;
use chainview_core::indexer::TailState;
use chainview_core::source::Notifications;
use chainview_core::types::Sequence;

use crate::engine::{CatchUpReport, Shared, StreamLease, TailEvent};

/// Catch up from the stored cursor (or `start`, whichever is later) until
/// an empty fetch confirms the head did not move.
pub(crate) async fn catch_up(
    shared: &Shared,
    stream: &str,
    start: Sequence,
    cancel: &mut watch::Receiver<bool>,
) -> Result<CatchUpReport, IndexerError> {
    let mut report = CatchUpReport::default();
    let mut last_head: Option<Sequence> = None;

    loop {
        if *cancel.borrow() {
            return Err(IndexerError::Cancelled { stream: stream.to_string() });
        }
        let batch = next_batch(shared, stream, start).await?;
        apply(shared, stream, &batch, &mut report).await?;

        if batch.events.is_empty() && batch.reached_head() && last_head == Some(batch.head) {
            report.head = batch.head;
            report.cursor = shared.cursors.get(stream).await?;
            info!(
                stream,
                head = %report.head,
                events = report.events,
                batches = report.batches,
                "caught up"
            );
            shared.emit(TailEvent::CaughtUp {
                stream: stream.to_string(),
                cursor: report.cursor,
                head: report.head,
            });
            return Ok(report);
        }
        last_head = Some(batch.head);
    }
}

/// Body of the spawned live task. Owns the stream lease until it returns.
pub(crate) async fn run_live(
    shared: Arc<Shared>,
    stream: String,
    start: Sequence,
    lease: StreamLease,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), IndexerError> {
    let result = live(&shared, &stream, start, &mut cancel).await;
    match &result {
        Ok(()) => {
            info!(stream, "indexing stopped");
            shared.set_state(&stream, TailState::Stopped);
            shared.emit(TailEvent::Stopped { stream: stream.clone() });
        }
        Err(e) => {
            error!(stream, error = %e, "indexing failed");
            shared.fail(&stream, e);
            shared.emit(TailEvent::Failed { stream: stream.clone(), error: e.clone() });
        }
    }
    drop(lease);
    result
}

enum Trigger {
    Notified,
    Poll,
    Disconnected,
}

async fn live(
    shared: &Shared,
    stream: &str,
    start: Sequence,
    cancel: &mut watch::Receiver<bool>,
) -> Result<(), IndexerError> {
    let poll = shared.config.poll_interval();
    let mut notifications = enter_live(shared, stream).await;

    loop {
        if *cancel.borrow() {
            return Ok(());
        }
        let trigger = tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return Ok(());
                }
                continue;
            }
            trigger = next_trigger(&mut notifications, poll) => trigger,
        };

        let outcome = match trigger {
            Trigger::Disconnected => Err(IndexerError::SourceUnavailable {
                stream: stream.to_string(),
                attempts: 1,
                reason: "notification stream closed".into(),
            }),
            Trigger::Notified | Trigger::Poll => drain(shared, stream, start, cancel).await,
        };

        match outcome {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                warn!(stream, error = %e, "live tail lost the source, catching up");
                shared.set_state(stream, TailState::CatchingUp);
                shared.emit(TailEvent::FellBack { stream: stream.to_string(), reason: e.to_string() });
                if !recover(shared, stream, start, cancel, poll).await? {
                    return Ok(());
                }
                notifications = enter_live(shared, stream).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retry catch-up every poll interval until it succeeds. Returns `false` if
/// cancelled meanwhile.
async fn recover(
    shared: &Shared,
    stream: &str,
    start: Sequence,
    cancel: &mut watch::Receiver<bool>,
    poll: Duration,
) -> Result<bool, IndexerError> {
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return Ok(false);
                }
            }
            _ = tokio::time::sleep(poll) => {}
        }
        match catch_up(shared, stream, start, cancel).await {
            Ok(_) => return Ok(true),
            Err(IndexerError::Cancelled { .. }) => return Ok(false),
            Err(e) if e.is_transient() => {
                warn!(stream, error = %e, "catch-up failed, will retry");
            }
            Err(e) => return Err(e),
        }
    }
}

async fn enter_live(shared: &Shared, stream: &str) -> Option<Notifications> {
    shared.set_state(stream, TailState::Live);
    shared.emit(TailEvent::EnteredLive { stream: stream.to_string() });

    let filter = shared.filter();
    match shared.fetcher.source().subscribe(stream, &filter).await {
        Ok(Some(notifications)) => {
            debug!(stream, "live tail on source notifications");
            Some(notifications)
        }
        Ok(None) => {
            debug!(stream, "live tail polling");
            None
        }
        Err(e) => {
            warn!(stream, error = %e, "subscribe failed, polling instead");
            None
        }
    }
}

/// The poll interval still fires while subscribed, so a silent notification
/// stream cannot stall the tail.
async fn next_trigger(notifications: &mut Option<Notifications>, poll: Duration) -> Trigger {
    match notifications {
        Some(stream) => match tokio::time::timeout(poll, stream.next()).await {
            Ok(Some(Ok(_))) => Trigger::Notified,
            Ok(Some(Err(_))) | Ok(None) => Trigger::Disconnected,
            Err(_) => Trigger::Poll,
        },
        None => {
            tokio::time::sleep(poll).await;
            Trigger::Poll
        }
    }
}

/// One live cycle: fetch and project until the observed head is reached.
/// A cancel request ends the cycle at the next batch boundary.
async fn drain(
    shared: &Shared,
    stream: &str,
    start: Sequence,
    cancel: &watch::Receiver<bool>,
) -> Result<(), IndexerError> {
    let mut report = CatchUpReport::default();
    loop {
        if *cancel.borrow() {
            debug!(stream, "live cycle cancelled");
            return Ok(());
        }
        let batch = next_batch(shared, stream, start).await?;
        apply(shared, stream, &batch, &mut report).await?;
        if batch.reached_head() {
            return Ok(());
        }
    }
}

async fn next_batch(shared: &Shared, stream: &str, start: Sequence) -> Result<FetchedBatch, IndexerError> {
    let from = match shared.cursors.get(stream).await? {
        Some(cursor) => cursor.next().max(start),
        None => start,
    };
    shared.fetcher.fetch_batch(stream, from, &shared.filter()).await
}

/// Project a batch and advance the cursor. On a projection failure the
/// cursor stops at the last fully applied event and the error is returned.
async fn apply(
    shared: &Shared,
    stream: &str,
    batch: &FetchedBatch,
    report: &mut CatchUpReport,
) -> Result<(), IndexerError> {
    report.batches += 1;
    if batch.events.is_empty() && batch.scanned_to.is_none() {
        return Ok(());
    }

    let registry = shared.registry();
    let outcome = shared.projector.project(stream, &registry, &batch.events).await;
    report.reduced += outcome.reduced;
    report.skipped += outcome.skipped;

    if let Some(err) = outcome.error {
        if let Some(applied) = outcome.applied_through {
            shared.cursors.set(stream, applied).await?;
        }
        return Err(err);
    }

    report.events += batch.events.len();
    if let Some(scanned) = batch.scanned_to {
        shared.cursors.set(stream, scanned).await?;
    }
    if !batch.events.is_empty() {
        shared.emit(TailEvent::BatchApplied {
            stream: stream.to_string(),
            events: batch.events.len(),
            cursor: batch.scanned_to,
            head: batch.head,
        });
    }
    Ok(())
}
