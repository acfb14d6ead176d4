//! Entity projector: folds events into the materialized store.
//!
//! Events are folded strictly in ascending sequence order, one `reduce` call
//! per (event, subscribed entity type), so accumulating reducers see the same
//! history whatever the batch boundaries were.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::entity::{Entity, EntityDefinition, EntityRegistry, EntityState, ReduceError};
use crate::error::IndexerError;
use crate::store::EntityStore;
use crate::types::{Event, Sequence};

/// Outcome of projecting one batch.
#[derive(Debug, Default)]
pub struct ProjectOutcome {
    /// Last event whose every subscribed reducer succeeded. The cursor may be
    /// advanced up to here and no further.
    pub applied_through: Option<Sequence>,
    /// Number of `reduce` invocations that produced a new state.
    pub reduced: usize,
    /// Applications skipped because the entity watermark already covered them.
    pub skipped: usize,
    /// The failure that stopped the batch, if any.
    pub error: Option<IndexerError>,
}

/// Applies entity definitions to events against an [`EntityStore`].
#[derive(Clone)]
pub struct Projector {
    store: Arc<dyn EntityStore>,
}

impl Projector {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// One reducer application. Pure: the same `(prior, event)` always gives
    /// the same state.
    pub fn apply(
        definition: &EntityDefinition,
        prior: Option<&EntityState>,
        event: &Event,
    ) -> Result<EntityState, ReduceError> {
        definition.reducer.reduce(prior, event)
    }

    /// Fold a batch for one entity type without writing to the store.
    ///
    /// Starts from the stored state of each touched id and returns the final
    /// state per id.
    pub async fn apply_batch(
        &self,
        entity_type: &str,
        definition: &EntityDefinition,
        events: &[Event],
    ) -> Result<BTreeMap<String, EntityState>, IndexerError> {
        let mut ordered: Vec<&Event> = events
            .iter()
            .filter(|e| definition.subscribes_to(&e.event_type))
            .collect();
        ordered.sort_by_key(|e| e.sequence);

        let mut working: BTreeMap<String, EntityState> = BTreeMap::new();
        for event in ordered {
            let id = resolve_id(entity_type, definition, event)?;
            if !working.contains_key(&id) {
                if let Some(stored) = self.store.get(entity_type, &id).await? {
                    working.insert(id.clone(), stored.state);
                }
            }
            let next = Self::apply(definition, working.get(&id), event)
                .map_err(|e| reducer_error(entity_type, Some(&id), event, e))?;
            working.insert(id, next);
        }
        Ok(working)
    }

    /// Fold `events` from `stream` into the store for every subscribed entity
    /// type. Stops at the first failure; see [`ProjectOutcome`].
    pub async fn project(
        &self,
        stream: &str,
        registry: &EntityRegistry,
        events: &[Event],
    ) -> ProjectOutcome {
        let mut ordered: Vec<&Event> = events.iter().collect();
        ordered.sort_by_key(|e| e.sequence);

        let mut outcome = ProjectOutcome::default();
        for event in ordered {
            for (entity_type, definition) in registry.subscribers(&event.event_type) {
                match self.fold_one(stream, entity_type, definition, event).await {
                    Ok(true) => outcome.reduced += 1,
                    Ok(false) => outcome.skipped += 1,
                    Err(e) => {
                        debug!(stream, sequence = %event.sequence, error = %e, "projection stopped");
                        outcome.error = Some(e);
                        return outcome;
                    }
                }
            }
            outcome.applied_through = Some(event.sequence);
        }
        outcome
    }

    /// Returns `Ok(false)` when the entity already reflects this event.
    async fn fold_one(
        &self,
        stream: &str,
        entity_type: &str,
        definition: &EntityDefinition,
        event: &Event,
    ) -> Result<bool, IndexerError> {
        let id = resolve_id(entity_type, definition, event)?;
        let current = self.store.get(entity_type, &id).await?;
        if current.as_ref().is_some_and(|e| e.has_applied(stream, event.sequence)) {
            return Ok(false);
        }

        let state = Self::apply(definition, current.as_ref().map(|e| &e.state), event)
            .map_err(|e| reducer_error(entity_type, Some(&id), event, e))?;

        let mut watermarks = current.map(|e| e.watermarks).unwrap_or_default();
        watermarks.insert(stream.to_string(), event.sequence);
        self.store
            .upsert(entity_type, Entity { id, state, watermarks })
            .await?;
        Ok(true)
    }
}

fn resolve_id(
    entity_type: &str,
    definition: &EntityDefinition,
    event: &Event,
) -> Result<String, IndexerError> {
    definition.id_field.resolve(event).ok_or_else(|| {
        reducer_error(
            entity_type,
            None,
            event,
            ReduceError::new(format!("cannot derive entity id ({:?})", definition.id_field)),
        )
    })
}

fn reducer_error(entity_type: &str, id: Option<&str>, event: &Event, err: ReduceError) -> IndexerError {
    IndexerError::Reducer {
        entity_type: entity_type.to_string(),
        entity_id: id.map(str::to_string),
        event: Box::new(event.clone()),
        reason: err.to_string(),
    }
}
