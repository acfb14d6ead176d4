//! Entity definitions and the reducer contract.
//!
//! An entity type is a read model folded from events. The embedding
//! application supplies, per entity type, how to derive the entity id from an
//! event, which event types it listens to, and a pure `reduce` function.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Event, Sequence};
use crate::value::Value;

/// Materialized fields of one entity. Only ever produced by a reducer.
pub type EntityState = BTreeMap<String, Value>;

/// One row of the materialized store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub state: EntityState,
    /// Per stream, the highest sequence already folded into this entity.
    #[serde(default)]
    pub watermarks: BTreeMap<String, Sequence>,
}

impl Entity {
    pub fn new(id: impl Into<String>, state: EntityState) -> Self {
        Self {
            id: id.into(),
            state,
            watermarks: BTreeMap::new(),
        }
    }

    /// Field lookup; `"id"` resolves to the entity id when the state has no
    /// field of that name.
    pub fn field(&self, name: &str) -> Option<Value> {
        match self.state.get(name) {
            Some(v) => Some(v.clone()),
            None if name == "id" => Some(Value::Str(self.id.clone())),
            None => None,
        }
    }

    /// Returns `true` if `event` from `stream` was already folded in.
    pub fn has_applied(&self, stream: &str, sequence: Sequence) -> bool {
        self.watermarks.get(stream).is_some_and(|w| sequence <= *w)
    }
}

// ─── Reducer ─────────────────────────────────────────────────────────────────

/// Failure reported by a reducer.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ReduceError(pub String);

impl ReduceError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Folds one event into the prior state of an entity.
///
/// Must be deterministic, synchronous and free of side effects: the engine
/// may call it again for the same `(prior, event)` pair after a crash.
pub trait Reducer: Send + Sync {
    fn reduce(&self, prior: Option<&EntityState>, event: &Event) -> Result<EntityState, ReduceError>;
}

impl<F> Reducer for F
where
    F: Fn(Option<&EntityState>, &Event) -> Result<EntityState, ReduceError> + Send + Sync,
{
    fn reduce(&self, prior: Option<&EntityState>, event: &Event) -> Result<EntityState, ReduceError> {
        self(prior, event)
    }
}

// ─── Id derivation ───────────────────────────────────────────────────────────

type DeriveFn = dyn Fn(&Event) -> Option<String> + Send + Sync;

/// How an entity id is derived from an event.
#[derive(Clone)]
pub enum IdField {
    /// Use the display form of a payload field (e.g. `to` for a holding).
    Field(String),
    /// Compute the id (e.g. a composite `sender-timestamp` message id).
    Derive(Arc<DeriveFn>),
}

impl IdField {
    pub fn field(name: impl Into<String>) -> Self {
        IdField::Field(name.into())
    }

    pub fn derive<F>(f: F) -> Self
    where
        F: Fn(&Event) -> Option<String> + Send + Sync + 'static,
    {
        IdField::Derive(Arc::new(f))
    }

    /// The entity id targeted by `event`, or `None` if it cannot be derived.
    pub fn resolve(&self, event: &Event) -> Option<String> {
        match self {
            IdField::Field(name) => event.get(name).filter(|v| !v.is_null()).map(|v| v.to_string()),
            IdField::Derive(f) => f(event),
        }
    }
}

impl fmt::Debug for IdField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdField::Field(name) => f.debug_tuple("Field").field(name).finish(),
            IdField::Derive(_) => f.write_str("Derive(..)"),
        }
    }
}

// ─── EntityDefinition ────────────────────────────────────────────────────────

/// Static description of one entity type, supplied by the application.
#[derive(Clone)]
pub struct EntityDefinition {
    pub id_field: IdField,
    pub subscribed_events: Vec<String>,
    pub reducer: Arc<dyn Reducer>,
    /// Bumped by the application whenever the reducer's output shape
    /// changes; a mismatch with persisted state forces a re-index.
    pub schema_version: u32,
}

impl EntityDefinition {
    /// Start a definition keyed by `id_field`.
    ///
    /// ```rust
    /// use chainview_core::entity::{EntityDefinition, IdField};
    ///
    /// let def = EntityDefinition::new(IdField::field("to"))
    ///     .on("Transfer")
    ///     .reduce(|prior, _event| Ok(prior.cloned().unwrap_or_default()));
    /// assert!(def.subscribes_to("Transfer"));
    /// ```
    pub fn new(id_field: IdField) -> EntityDefinitionBuilder {
        EntityDefinitionBuilder {
            id_field,
            subscribed_events: Vec::new(),
            schema_version: 1,
        }
    }

    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.subscribed_events.iter().any(|t| t == event_type)
    }
}

impl fmt::Debug for EntityDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDefinition")
            .field("id_field", &self.id_field)
            .field("subscribed_events", &self.subscribed_events)
            .field("schema_version", &self.schema_version)
            .finish()
    }
}

/// Builder returned by [`EntityDefinition::new`]; finished by `reduce`.
pub struct EntityDefinitionBuilder {
    id_field: IdField,
    subscribed_events: Vec<String>,
    schema_version: u32,
}

impl EntityDefinitionBuilder {
    /// Subscribe to an event type.
    pub fn on(mut self, event_type: impl Into<String>) -> Self {
        self.subscribed_events.push(event_type.into());
        self
    }

    pub fn version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    /// Finish with a reducer closure or function.
    pub fn reduce<F>(self, f: F) -> EntityDefinition
    where
        F: Fn(Option<&EntityState>, &Event) -> Result<EntityState, ReduceError>
            + Send
            + Sync
            + 'static,
    {
        self.reducer(f)
    }

    /// Finish with any [`Reducer`] implementation.
    pub fn reducer<R: Reducer + 'static>(self, reducer: R) -> EntityDefinition {
        EntityDefinition {
            id_field: self.id_field,
            subscribed_events: self.subscribed_events,
            reducer: Arc::new(reducer),
            schema_version: self.schema_version,
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Entity type name → definition.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    definitions: HashMap<String, EntityDefinition>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an entity type. Returns the previous definition.
    pub fn register(
        &mut self,
        entity_type: impl Into<String>,
        definition: EntityDefinition,
    ) -> Option<EntityDefinition> {
        self.definitions.insert(entity_type.into(), definition)
    }

    pub fn get(&self, entity_type: &str) -> Option<&EntityDefinition> {
        self.definitions.get(entity_type)
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.definitions.contains_key(entity_type)
    }

    /// Definitions subscribed to `event_type`, in entity-type name order so
    /// that projection order is deterministic.
    pub fn subscribers(&self, event_type: &str) -> Vec<(&str, &EntityDefinition)> {
        let mut subs: Vec<_> = self
            .definitions
            .iter()
            .filter(|(_, def)| def.subscribes_to(event_type))
            .map(|(name, def)| (name.as_str(), def))
            .collect();
        subs.sort_by(|a, b| a.0.cmp(b.0));
        subs
    }

    /// Every event type some definition listens to.
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .definitions
            .values()
            .flat_map(|d| d.subscribed_events.iter().cloned())
            .collect();
        types.sort();
        types.dedup();
        types
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EntityDefinition)> {
        self.definitions.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
