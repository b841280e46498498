//! Per-type entity schemas and capability facets.
//!
//! A schema says which dynamic properties a type requires, whether the type
//! carries a unique alias, which nested collections it declares, and how it
//! treats self-connections. Types with no registered schema get an open
//! default that accepts any dynamic property.

use std::borrow::Cow;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const TYPE_APPLICATION: &str = "application";
pub const TYPE_USER: &str = "user";
pub const TYPE_GROUP: &str = "group";
pub const TYPE_ROLE: &str = "role";

/// Whether an entity of a type may connect to itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SelfConnectionPolicy {
    #[default]
    Permit,
    Forbid,
    /// Forbid only for the listed verbs.
    ForbidVerbs(Vec<String>),
}

impl SelfConnectionPolicy {
    pub fn allows(&self, verb: &str) -> bool {
        match self {
            Self::Permit => true,
            Self::Forbid => false,
            Self::ForbidVerbs(verbs) => !verbs.iter().any(|v| v.eq_ignore_ascii_case(verb)),
        }
    }
}

/// Optional capabilities attached to a type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Facets {
    /// Entities of this type can hold permission grants.
    pub permissions: bool,
    /// Entities of this type are roles (title + inactivity policy).
    pub role: bool,
    /// Entities of this type can be members of roles.
    pub role_member: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntitySchema {
    pub entity_type: String,
    /// Dynamic properties that must be present and non-null.
    #[serde(default)]
    pub required: Vec<String>,
    /// Property whose value is unique within the type. `"name"` means the
    /// system `name` field.
    #[serde(default)]
    pub alias_property: Option<String>,
    #[serde(default)]
    pub name_required: bool,
    #[serde(default = "default_true")]
    pub name_mutable: bool,
    /// Closed property list; `None` keeps every dynamic property.
    #[serde(default)]
    pub declared: Option<Vec<String>>,
    #[serde(default)]
    pub self_connections: SelfConnectionPolicy,
    /// Nested collections routed as containment rather than connections.
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub facets: Facets,
}

fn default_true() -> bool {
    true
}

impl EntitySchema {
    /// An open schema: no required properties, no alias, every verb allowed.
    pub fn open(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            required: Vec::new(),
            alias_property: None,
            name_required: false,
            name_mutable: true,
            declared: None,
            self_connections: SelfConnectionPolicy::Permit,
            collections: Vec::new(),
            facets: Facets::default(),
        }
    }

    pub fn with_required(mut self, props: &[&str]) -> Self {
        self.required = props.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_alias(mut self, property: &str) -> Self {
        self.alias_property = Some(property.to_string());
        if property == crate::entity::PROPERTY_NAME {
            self.name_required = true;
            self.name_mutable = false;
        }
        self
    }

    pub fn with_declared(mut self, props: &[&str]) -> Self {
        self.declared = Some(props.iter().map(|p| p.to_string()).collect());
        self
    }

    pub fn with_collections(mut self, names: &[&str]) -> Self {
        self.collections = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_self_connections(mut self, policy: SelfConnectionPolicy) -> Self {
        self.self_connections = policy;
        self
    }

    pub fn with_facets(mut self, facets: Facets) -> Self {
        self.facets = facets;
        self
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.iter().any(|c| c.eq_ignore_ascii_case(name))
    }

    /// Whether a dynamic property survives canonicalization.
    pub fn is_declared(&self, property: &str) -> bool {
        match &self.declared {
            Some(list) => list.iter().any(|p| p == property),
            None => true,
        }
    }

    pub fn is_alias_property(&self, property: &str) -> bool {
        self.alias_property.as_deref() == Some(property)
    }
}

/// Registry of schemas keyed by entity type.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, EntitySchema>,
}

impl SchemaRegistry {
    /// An empty registry: every type resolves to an open schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// The platform's built-in types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register(
            EntitySchema::open(TYPE_APPLICATION)
                .with_collections(&["users", "groups", "roles"])
                .with_self_connections(SelfConnectionPolicy::Forbid),
        );

        registry.register(
            EntitySchema::open(TYPE_USER)
                .with_required(&["username"])
                .with_alias("username")
                .with_collections(&["activities", "devices"])
                .with_self_connections(SelfConnectionPolicy::ForbidVerbs(vec![
                    "following".to_string(),
                ]))
                .with_facets(Facets {
                    permissions: true,
                    role_member: true,
                    ..Facets::default()
                }),
        );

        registry.register(
            EntitySchema::open(TYPE_GROUP)
                .with_required(&["path"])
                .with_alias("path")
                .with_collections(&["users", "roles", "activities"])
                .with_facets(Facets {
                    permissions: true,
                    ..Facets::default()
                }),
        );

        registry.register(
            EntitySchema::open(TYPE_ROLE)
                .with_alias(crate::entity::PROPERTY_NAME)
                .with_declared(&["title", "inactivity", "group"])
                .with_self_connections(SelfConnectionPolicy::Forbid)
                .with_facets(Facets {
                    permissions: true,
                    role: true,
                    ..Facets::default()
                }),
        );

        registry
    }

    /// Add or replace the schema for a type.
    pub fn register(&mut self, schema: EntitySchema) {
        self.schemas.insert(schema.entity_type.clone(), schema);
    }

    pub fn get(&self, entity_type: &str) -> Option<&EntitySchema> {
        self.schemas.get(entity_type)
    }

    /// The registered schema, or an open one for unknown types.
    pub fn resolve(&self, entity_type: &str) -> Cow<'_, EntitySchema> {
        match self.schemas.get(entity_type) {
            Some(schema) => Cow::Borrowed(schema),
            None => Cow::Owned(EntitySchema::open(entity_type)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_types_resolve_open() {
        let registry = SchemaRegistry::with_builtins();
        let schema = registry.resolve("note");
        assert_eq!(schema.entity_type, "note");
        assert!(schema.required.is_empty());
        assert!(schema.alias_property.is_none());
        assert!(schema.self_connections.allows("likes"));
    }

    #[test]
    fn role_alias_is_its_name() {
        let registry = SchemaRegistry::with_builtins();
        let role = registry.resolve(TYPE_ROLE);
        assert!(role.name_required);
        assert!(!role.name_mutable);
        assert!(role.facets.role);
        assert!(!role.is_declared("color"));
        assert!(role.is_declared("title"));
    }

    #[test]
    fn forbid_verbs_is_case_insensitive() {
        let policy = SelfConnectionPolicy::ForbidVerbs(vec!["following".to_string()]);
        assert!(!policy.allows("Following"));
        assert!(policy.allows("likes"));
    }
}
