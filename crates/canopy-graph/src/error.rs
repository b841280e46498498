use canopy_core::error::PermissionError;
use canopy_core::{EntityId, ValidationError};
use canopy_store::StoreError;

/// Errors from entity-graph operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Not found: {entity_type} '{key}'")]
    NotFound { entity_type: String, key: String },

    #[error("Duplicate {entity_type}: '{alias}' is already taken")]
    Duplicate { entity_type: String, alias: String },

    #[error("Concurrent modification of {id}: gave up after {attempts} attempts")]
    ConcurrentModification { id: EntityId, attempts: u32 },

    #[error("Self-connection '{verb}' not permitted for {entity_type} {id}")]
    SelfConnection {
        entity_type: String,
        verb: String,
        id: EntityId,
    },

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error("Invalid {what} '{value}': {reason}")]
    InvalidName {
        what: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl GraphError {
    pub fn not_found(entity_type: impl Into<String>, key: impl ToString) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
