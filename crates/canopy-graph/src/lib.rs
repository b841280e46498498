//! Canopy Graph — entities, collections, connections, and roles.
//!
//! [`EntityManager`] implements every entity-graph operation on top of
//! [`canopy_store::StoreClient`]. Relationships are stored as keys holding
//! identifiers only, never as embedded records, so deleting an entity is a
//! sweep over a bounded set of key prefixes.

pub mod cascade;
pub mod collections;
pub mod connections;
pub mod entities;
pub mod error;
pub mod keys;
pub mod manager;
mod paging;
pub mod roles;

pub use collections::CollectionRef;
pub use error::{GraphError, Result};
pub use manager::EntityManager;
pub use roles::{Grantee, RoleKey};
