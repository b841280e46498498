//! canopy-core: Entity model, schemas, and shared types for the Canopy platform.
//!
//! This crate provides the foundational pieces used by every Canopy component:
//! - Identifier and request-context types (tenants, entities, principals)
//! - The entity record with its system-property table and dynamic property bag
//! - Per-type schemas and capability facets
//! - Permission pattern matching
//! - Deterministic collection-name inflection
//! - Configuration management

pub mod config;
pub mod entity;
pub mod error;
pub mod inflection;
pub mod permission;
pub mod schema;
pub mod types;

pub use entity::Entity;
pub use error::{ValidationError, Violation};
pub use schema::{EntitySchema, SchemaRegistry};
pub use types::{
    CancelSignal, Connection, Context, Direction, EntityId, EntityRef, Principal, TenantId,
};
