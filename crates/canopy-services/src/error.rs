//! Error types for the canopy-services crate.

use thiserror::Error;

use crate::request::RequestState;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Graph(#[from] canopy_graph::GraphError),

    #[error("{principal} lacks permission {permission}")]
    AuthorizationDenied {
        principal: String,
        permission: String,
    },

    #[error("Unknown resource: /{path}")]
    UnknownResource { path: String },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Illegal request transition {from:?} -> {to:?}")]
    IllegalTransition { from: RequestState, to: RequestState },

    #[error("Request cancelled before execution")]
    Cancelled,
}

impl ServiceError {
    /// The state a request ends in when it fails with this error.
    pub fn terminal_state(&self) -> RequestState {
        match self {
            ServiceError::AuthorizationDenied { .. } => RequestState::Denied,
            _ => RequestState::Failed,
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        ServiceError::BadRequest(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
