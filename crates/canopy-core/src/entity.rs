//! The entity record: a fixed set of system properties plus an open map of
//! dynamic properties.
//!
//! System properties are described by [`SYSTEM_PROPERTIES`] and checked
//! explicitly on every write. Dynamic properties are schema-less and merged
//! key by key on update. Metadata is transient and never persisted.

use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{ValidationError, Violation};
use crate::inflection::pluralize;
use crate::schema::EntitySchema;
use crate::types::{EntityId, EntityRef, TenantId};

pub const PROPERTY_ID: &str = "id";
pub const PROPERTY_TYPE: &str = "type";
pub const PROPERTY_NAME: &str = "name";
pub const PROPERTY_CREATED: &str = "created";
pub const PROPERTY_MODIFIED: &str = "modified";
pub const PROPERTY_URI: &str = "uri";
pub const PROPERTY_METADATA: &str = "metadata";

/// Constraint flags for one system property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyRule {
    pub name: &'static str,
    pub required: bool,
    pub mutable: bool,
    pub indexed: bool,
}

/// Validation table for the system properties.
///
/// `name` is listed as mutable here; types with an aliased name override
/// that through their schema.
pub const SYSTEM_PROPERTIES: [PropertyRule; 5] = [
    PropertyRule {
        name: PROPERTY_ID,
        required: true,
        mutable: false,
        indexed: false,
    },
    PropertyRule {
        name: PROPERTY_TYPE,
        required: true,
        mutable: false,
        indexed: true,
    },
    PropertyRule {
        name: PROPERTY_CREATED,
        required: true,
        mutable: false,
        indexed: true,
    },
    PropertyRule {
        name: PROPERTY_MODIFIED,
        required: true,
        mutable: true,
        indexed: true,
    },
    PropertyRule {
        name: PROPERTY_NAME,
        required: false,
        mutable: true,
        indexed: true,
    },
];

pub fn system_property(name: &str) -> Option<&'static PropertyRule> {
    SYSTEM_PROPERTIES.iter().find(|rule| rule.name == name)
}

/// Keys computed on the way out and never accepted on the way in.
pub fn is_derived(name: &str) -> bool {
    name == PROPERTY_URI || name == PROPERTY_METADATA
}

/// A typed, uniquely identified record.
///
/// The serde form is the stored form. Use [`Entity::to_wire`] for the
/// ordered representation handed to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(skip)]
    metadata: Map<String, Value>,
}

impl Entity {
    /// Build and validate a new entity of `schema`'s type.
    ///
    /// Collects every violation before failing. Caller-supplied `id` and
    /// `created` are rejected, a `type` other than the schema's is rejected,
    /// and derived keys are dropped.
    pub fn create(
        schema: &EntitySchema,
        mut initial: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let entity_type = schema.entity_type.clone();
        let mut violations = Vec::new();

        if entity_type.is_empty() || entity_type.contains(['/', ':']) {
            violations.push(Violation::InvalidValue {
                property: PROPERTY_TYPE.to_string(),
                reason: "type must be non-empty and contain no '/' or ':'".to_string(),
            });
        }

        if initial.remove(PROPERTY_ID).is_some() {
            violations.push(Violation::ImmutableProperty {
                property: PROPERTY_ID.to_string(),
            });
        }
        if let Some(found) = initial.remove(PROPERTY_TYPE) {
            if found.as_str() != Some(entity_type.as_str()) {
                violations.push(Violation::TypeMismatch {
                    expected: entity_type.clone(),
                    found: display_value(&found),
                });
            }
        }
        if initial.remove(PROPERTY_CREATED).is_some() {
            violations.push(Violation::ImmutableProperty {
                property: PROPERTY_CREATED.to_string(),
            });
        }
        initial.remove(PROPERTY_MODIFIED);
        initial.remove(PROPERTY_URI);
        initial.remove(PROPERTY_METADATA);

        let name = match initial.remove(PROPERTY_NAME) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(_) => {
                violations.push(Violation::InvalidValue {
                    property: PROPERTY_NAME.to_string(),
                    reason: "must be a string".to_string(),
                });
                None
            }
        };
        if schema.name_required && name.as_deref().map_or(true, str::is_empty) {
            violations.push(Violation::MissingRequired {
                property: PROPERTY_NAME.to_string(),
            });
        }

        for required in &schema.required {
            if initial.get(required).map_or(true, Value::is_null) {
                violations.push(Violation::MissingRequired {
                    property: required.clone(),
                });
            }
        }

        if let Some(alias) = schema.alias_property.as_deref() {
            if alias != PROPERTY_NAME {
                if let Some(value) = initial.get(alias) {
                    if !value.is_string() && !value.is_null() {
                        violations.push(Violation::InvalidValue {
                            property: alias.to_string(),
                            reason: "alias must be a string".to_string(),
                        });
                    }
                }
            }
        }

        if initial.keys().any(|k| k.is_empty()) {
            violations.push(Violation::InvalidValue {
                property: String::new(),
                reason: "property names must be non-empty".to_string(),
            });
        }

        if !violations.is_empty() {
            return Err(ValidationError {
                entity_type,
                violations,
            });
        }

        initial.retain(|_, v| !v.is_null());

        Ok(Self {
            id: EntityId::new(),
            entity_type,
            name,
            created: now,
            modified: now,
            properties: initial,
            metadata: Map::new(),
        })
    }

    /// Merge `delta` into this entity and advance `modified`.
    ///
    /// Keys absent from `delta` are untouched; a `null` value removes that
    /// one key. Nothing is applied unless every key passes validation.
    /// Returns the names of the keys that changed.
    pub fn apply_delta(
        &mut self,
        schema: &EntitySchema,
        delta: &Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, ValidationError> {
        let mut violations = Vec::new();

        for (key, value) in delta {
            if let Some(rule) = system_property(key) {
                if !rule.mutable && self.property(key).as_ref() != Some(value) {
                    violations.push(Violation::ImmutableProperty {
                        property: key.clone(),
                    });
                }
            }
            match key.as_str() {
                PROPERTY_ID | PROPERTY_TYPE | PROPERTY_CREATED | PROPERTY_MODIFIED => {}
                PROPERTY_NAME => {
                    let proposed = value.as_str().map(str::to_string);
                    if !value.is_null() && proposed.is_none() {
                        violations.push(Violation::InvalidValue {
                            property: key.clone(),
                            reason: "must be a string".to_string(),
                        });
                    } else if proposed != self.name && !schema.name_mutable {
                        violations.push(Violation::ImmutableProperty {
                            property: key.clone(),
                        });
                    } else if proposed.is_none() && schema.name_required {
                        violations.push(Violation::MissingRequired {
                            property: key.clone(),
                        });
                    }
                }
                k if is_derived(k) => {}
                k if schema.is_alias_property(k) => {
                    if self.properties.get(k) != Some(value) {
                        violations.push(Violation::ImmutableProperty {
                            property: key.clone(),
                        });
                    }
                }
                k if value.is_null() && schema.required.iter().any(|r| r == k) => {
                    violations.push(Violation::MissingRequired {
                        property: key.clone(),
                    });
                }
                "" => violations.push(Violation::InvalidValue {
                    property: String::new(),
                    reason: "property names must be non-empty".to_string(),
                }),
                _ => {}
            }
        }

        if !violations.is_empty() {
            return Err(ValidationError {
                entity_type: self.entity_type.clone(),
                violations,
            });
        }

        let mut changed = Vec::new();
        for (key, value) in delta {
            match key.as_str() {
                PROPERTY_ID | PROPERTY_TYPE | PROPERTY_CREATED | PROPERTY_MODIFIED => {}
                k if is_derived(k) => {}
                PROPERTY_NAME => {
                    let proposed = value.as_str().map(str::to_string);
                    if proposed != self.name {
                        self.name = proposed;
                        changed.push(key.clone());
                    }
                }
                _ if value.is_null() => {
                    if self.properties.remove(key).is_some() {
                        changed.push(key.clone());
                    }
                }
                _ => {
                    if self.properties.get(key) != Some(value) {
                        self.properties.insert(key.clone(), value.clone());
                        changed.push(key.clone());
                    }
                }
            }
        }

        self.modified = next_modified(self.modified, now);
        Ok(changed)
    }

    /// Read any property by name, system or dynamic.
    pub fn property(&self, name: &str) -> Option<Value> {
        match name {
            PROPERTY_ID => Some(Value::String(self.id.to_string())),
            PROPERTY_TYPE => Some(Value::String(self.entity_type.clone())),
            PROPERTY_NAME => self.name.clone().map(Value::String),
            PROPERTY_CREATED => serde_json::to_value(self.created).ok(),
            PROPERTY_MODIFIED => serde_json::to_value(self.modified).ok(),
            _ => self.properties.get(name).cloned(),
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match name {
            PROPERTY_TYPE => Some(&self.entity_type),
            PROPERTY_NAME => self.name.as_deref(),
            _ => self.properties.get(name).and_then(Value::as_str),
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.id, self.entity_type.clone())
    }

    /// The value of the schema's alias property, if the type has one.
    pub fn alias_value(&self, schema: &EntitySchema) -> Option<String> {
        let alias = schema.alias_property.as_deref()?;
        self.get_str(alias).map(str::to_string)
    }

    /// Stable listing order: `created` ascending, then `id`.
    pub fn compare(&self, other: &Entity) -> Ordering {
        self.created
            .cmp(&other.created)
            .then_with(|| self.id.cmp(&other.id))
    }

    /// The persisted form: metadata stripped and, for closed schemas,
    /// undeclared dynamic properties dropped.
    pub fn to_canonical(&self, schema: &EntitySchema) -> Entity {
        let mut canonical = self.clone();
        canonical.metadata.clear();
        canonical.properties.retain(|k, _| schema.is_declared(k));
        canonical
    }

    // ── Metadata ─────────────────────────────────────────────────

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn metadata_map(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }

    pub fn merge_metadata(&mut self, other: Map<String, Value>) {
        self.metadata.extend(other);
    }

    pub fn clear_metadata(&mut self) {
        self.metadata.clear();
    }

    // ── Wire form ────────────────────────────────────────────────

    /// `{base_uri}/{tenant}/{collection}/{id}`.
    pub fn uri(&self, base_uri: &str, tenant_id: &TenantId) -> String {
        format!(
            "{}/{}/{}/{}",
            base_uri.trim_end_matches('/'),
            tenant_id,
            pluralize(&self.entity_type),
            self.id
        )
    }

    pub fn to_wire(&self, base_uri: &str, tenant_id: &TenantId) -> WireEntity<'_> {
        WireEntity {
            entity: self,
            uri: self.uri(base_uri, tenant_id),
        }
    }
}

/// Ordered client representation: `id, type, uri, name`, then the other
/// system properties, the dynamic properties, and any metadata.
pub struct WireEntity<'a> {
    entity: &'a Entity,
    uri: String,
}

impl Serialize for WireEntity<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let e = self.entity;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(PROPERTY_ID, &e.id)?;
        map.serialize_entry(PROPERTY_TYPE, &e.entity_type)?;
        map.serialize_entry(PROPERTY_URI, &self.uri)?;
        if let Some(name) = &e.name {
            map.serialize_entry(PROPERTY_NAME, name)?;
        }
        map.serialize_entry(PROPERTY_CREATED, &e.created)?;
        map.serialize_entry(PROPERTY_MODIFIED, &e.modified)?;
        for (key, value) in &e.properties {
            map.serialize_entry(key, value)?;
        }
        if !e.metadata.is_empty() {
            map.serialize_entry(PROPERTY_METADATA, &e.metadata)?;
        }
        map.end()
    }
}

/// The next `modified` stamp: `now`, or one microsecond past `prev` when the
/// clock has not moved forward.
pub fn next_modified(prev: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > prev {
        now
    } else {
        prev + Duration::microseconds(1)
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
