//! Canopy Store — storage primitives for the entity graph.
//!
//! Every read and write of the entity graph flows through [`StoreClient`],
//! which wraps a [`Storage`] backend and bounds each call with a caller-supplied
//! timeout. Backends expose only single-key operations plus prefix scans and
//! batch writes; there are no cross-key transactions.

pub mod backend;
pub mod client;
pub mod cursor;
pub mod memory;
pub mod neo4j;

pub use backend::{BatchOp, Cell, Storage};
pub use client::{Page, PageRequest, StoreClient, StoreError};
pub use memory::MemoryStorage;
pub use neo4j::Neo4jStorage;
