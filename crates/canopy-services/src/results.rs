//! Result sets returned by the dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use canopy_core::{Entity, EntityId, TenantId};

/// How one submitted element fared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded { index: usize, id: EntityId },
    Failed { index: usize, error: String },
}

impl Outcome {
    pub fn index(&self) -> usize {
        match self {
            Outcome::Succeeded { index, .. } | Outcome::Failed { index, .. } => *index,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded { .. })
    }
}

/// Entities affected or matched by a request, plus auxiliary data for
/// query-shaped actions.
#[derive(Debug, Clone)]
pub struct ServiceResults {
    pub entities: Vec<Entity>,
    pub data: Option<Map<String, Value>>,
    /// One entry per submitted element, in submission order. Empty for
    /// requests without a payload.
    pub outcomes: Vec<Outcome>,
    pub failures: usize,
    pub cursor: Option<String>,
    /// Set when cancellation stopped a batch before its last element.
    pub cancelled: bool,
    pub timestamp: DateTime<Utc>,
}

impl Default for ServiceResults {
    fn default() -> Self {
        Self {
            entities: Vec::new(),
            data: None,
            outcomes: Vec::new(),
            failures: 0,
            cursor: None,
            cancelled: false,
            timestamp: Utc::now(),
        }
    }
}

impl ServiceResults {
    pub fn single(entity: Entity) -> Self {
        Self {
            entities: vec![entity],
            ..Self::default()
        }
    }

    /// A page of a listing: `data = {count, cursor}`.
    pub fn listing(entities: Vec<Entity>, cursor: Option<String>) -> Self {
        let mut data = Map::new();
        data.insert("count".to_string(), json!(entities.len()));
        data.insert("cursor".to_string(), json!(cursor));
        Self {
            entities,
            data: Some(data),
            cursor,
            ..Self::default()
        }
    }

    pub fn record_success(&mut self, index: usize, entity: Entity) {
        self.outcomes.push(Outcome::Succeeded {
            index,
            id: entity.id,
        });
        self.entities.push(entity);
    }

    pub fn record_failure(&mut self, index: usize, error: impl ToString) {
        self.outcomes.push(Outcome::Failed {
            index,
            error: error.to_string(),
        });
        self.failures += 1;
    }

    pub fn successes(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    /// The client representation, with entities in wire form.
    pub fn to_wire(&self, base_uri: &str, tenant_id: &TenantId) -> Value {
        let entities: Vec<Value> = self
            .entities
            .iter()
            .map(|e| wire_value(&e.id, &e.to_wire(base_uri, tenant_id)))
            .collect();

        let mut out = Map::new();
        out.insert("timestamp".to_string(), json!(self.timestamp));
        out.insert("entities".to_string(), Value::Array(entities));
        if let Some(data) = &self.data {
            out.insert("data".to_string(), Value::Object(data.clone()));
        }
        if !self.outcomes.is_empty() {
            out.insert("outcomes".to_string(), json!(self.outcomes));
            out.insert("failures".to_string(), json!(self.failures));
        }
        if let Some(cursor) = &self.cursor {
            out.insert("cursor".to_string(), json!(cursor));
        }
        if self.cancelled {
            out.insert("cancelled".to_string(), json!(true));
        }
        Value::Object(out)
    }
}

/// A wire entity as JSON. A serialization failure is logged and sent as
/// `null`, keeping the positions of the other entities.
fn wire_value<T: Serialize>(id: &EntityId, wire: &T) -> Value {
    match serde_json::to_value(wire) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                entity_id = %id,
                error = %e,
                "Entity could not be serialized for the wire"
            );
            Value::Null
        }
    }
}
