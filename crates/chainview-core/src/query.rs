//! Query specs and their in-memory evaluation.
//!
//! Backends hand the candidate rows of one entity type to [`evaluate`];
//! filtering, the deterministic sort and both pagination styles live here so
//! every store answers a [`QuerySpec`] identically.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::types::{Event, Sequence};
use crate::value::Value;

// ─── Predicates ──────────────────────────────────────────────────────────────

/// Comparison operator of a [`Predicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Op {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            Op::Eq => ord == Ordering::Equal,
            Op::Ne => ord != Ordering::Equal,
            Op::Lt => ord == Ordering::Less,
            Op::Lte => ord != Ordering::Greater,
            Op::Gt => ord == Ordering::Greater,
            Op::Gte => ord != Ordering::Less,
        }
    }
}

impl std::str::FromStr for Op {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" | "=" => Ok(Op::Eq),
            "ne" | "!=" => Ok(Op::Ne),
            "lt" | "<" => Ok(Op::Lt),
            "lte" | "<=" => Ok(Op::Lte),
            "gt" | ">" => Ok(Op::Gt),
            "gte" | ">=" => Ok(Op::Gte),
            other => Err(format!("unknown operator: {other}")),
        }
    }
}

/// `field <op> value`. A missing or incomparable field fails the predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: String,
    pub op: Op,
    pub value: Value,
}

impl Predicate {
    pub fn new(field: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Evaluate against a (possibly missing) field value.
    pub fn matches(&self, actual: Option<&Value>) -> bool {
        actual
            .and_then(|v| v.compare(&self.value))
            .is_some_and(|ord| self.op.holds(ord))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

// ─── Entity queries ──────────────────────────────────────────────────────────

/// Keyset continuation: the sort value and id of the last row returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    pub id: String,
    pub sort_value: Option<Value>,
}

/// A read request against one entity type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySpec {
    /// ANDed predicates.
    pub filters: Vec<Predicate>,
    pub order_by: Option<String>,
    pub order: SortOrder,
    pub limit: Option<usize>,
    pub offset: usize,
    /// Resume after this row instead of using `offset`.
    pub after: Option<PageToken>,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.filters.push(Predicate::new(field, op, value));
        self
    }

    /// Shorthand for an equality filter.
    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, Op::Eq, value)
    }

    pub fn order_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.order_by = Some(field.into());
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn after(mut self, token: PageToken) -> Self {
        self.after = Some(token);
        self
    }

    /// Row comparator: sort field (missing values last in either direction),
    /// then entity id ascending.
    fn compare(&self, a_key: &Option<Value>, a_id: &str, b_key: &Option<Value>, b_id: &str) -> Ordering {
        let by_field = match (a_key, b_key) {
            (Some(a), Some(b)) => {
                let ord = a.sort_cmp(b);
                match self.order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            }
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_field.then_with(|| a_id.cmp(b_id))
    }

    fn sort_key(&self, entity: &Entity) -> Option<Value> {
        self.order_by.as_deref().and_then(|f| entity.field(f))
    }
}

/// One page of query results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPage {
    pub items: Vec<Entity>,
    /// Continuation for the next page; `None` when this page is the last.
    pub next: Option<PageToken>,
}

/// Filter, sort and paginate `rows` according to `spec`.
pub fn evaluate(rows: impl IntoIterator<Item = Entity>, spec: &QuerySpec) -> QueryPage {
    let mut keyed: Vec<(Option<Value>, Entity)> = rows
        .into_iter()
        .filter(|e| {
            spec.filters
                .iter()
                .all(|p| p.matches(e.field(&p.field).as_ref()))
        })
        .map(|e| (spec.sort_key(&e), e))
        .collect();

    keyed.sort_by(|(ak, a), (bk, b)| spec.compare(ak, &a.id, bk, &b.id));

    let start = match &spec.after {
        Some(token) => keyed
            .iter()
            .position(|(k, e)| spec.compare(k, &e.id, &token.sort_value, &token.id) == Ordering::Greater)
            .unwrap_or(keyed.len()),
        None => spec.offset.min(keyed.len()),
    };
    let end = match spec.limit {
        Some(limit) => start.saturating_add(limit).min(keyed.len()),
        None => keyed.len(),
    };

    let next = if end < keyed.len() && end > start {
        let (key, last) = &keyed[end - 1];
        Some(PageToken {
            id: last.id.clone(),
            sort_value: key.clone(),
        })
    } else {
        None
    };

    let items = keyed
        .into_iter()
        .skip(start)
        .take(end - start)
        .map(|(_, e)| e)
        .collect();
    QueryPage { items, next }
}

// ─── Raw event queries ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrder {
    #[default]
    Sequence,
    ObservedAt,
}

/// Ad-hoc query over raw events, for diagnostics and un-projected reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventQuery {
    /// Only this event type (`None` = all types).
    pub event_type: Option<String>,
    /// Predicates over payload fields; `origin` addresses the emitter.
    pub filters: Vec<Predicate>,
    pub order_by: EventOrder,
    pub order: SortOrder,
    pub limit: Option<usize>,
    /// Inclusive lower bound.
    pub from: Option<Sequence>,
    /// Inclusive upper bound.
    pub to: Option<Sequence>,
}

impl EventQuery {
    pub fn of_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            ..Default::default()
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.filters.push(Predicate::new(field, op, value));
        self
    }

    pub fn order_by(mut self, order_by: EventOrder, order: SortOrder) -> Self {
        self.order_by = order_by;
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(t) = &self.event_type {
            if &event.event_type != t {
                return false;
            }
        }
        if self.from.is_some_and(|f| event.sequence < f) || self.to.is_some_and(|t| event.sequence > t) {
            return false;
        }
        self.filters.iter().all(|p| {
            if p.field == "origin" && !event.payload.contains_key("origin") {
                p.matches(Some(&Value::Address(event.origin.clone())))
            } else {
                p.matches(event.get(&p.field))
            }
        })
    }
}

/// Filter, sort and truncate raw events.
pub fn evaluate_events(events: impl IntoIterator<Item = Event>, query: &EventQuery) -> Vec<Event> {
    let mut out: Vec<Event> = events.into_iter().filter(|e| query.matches(e)).collect();
    out.sort_by(|a, b| {
        let ord = match query.order_by {
            EventOrder::Sequence => a.sequence.cmp(&b.sequence),
            EventOrder::ObservedAt => a
                .observed_at
                .cmp(&b.observed_at)
                .then_with(|| a.sequence.cmp(&b.sequence)),
        };
        match query.order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    });
    if let Some(limit) = query.limit {
        out.truncate(limit);
    }
    out
}
