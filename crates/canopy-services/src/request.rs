//! Request types for the dispatch layer.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use canopy_core::EntityId;
use canopy_store::PageRequest;

use crate::error::{Result, ServiceError};

// ── Actions ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Create,
    Read,
    Update,
    Delete,
    List,
}

impl ServiceAction {
    /// The conventional HTTP method for the action.
    pub fn method(&self) -> &'static str {
        match self {
            ServiceAction::Create => "POST",
            ServiceAction::Read | ServiceAction::List => "GET",
            ServiceAction::Update => "PUT",
            ServiceAction::Delete => "DELETE",
        }
    }

    /// The action segment of the permission a request requires.
    pub fn permission(&self) -> &'static str {
        match self {
            ServiceAction::Create => "create",
            ServiceAction::Read => "read",
            ServiceAction::Update => "update",
            ServiceAction::Delete => "delete",
            ServiceAction::List => "list",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            ServiceAction::Create | ServiceAction::Update | ServiceAction::Delete
        )
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.permission())
    }
}

// ── Path parameters ───────────────────────────────────────────────

/// One path segment: an entity id, or a name (collection, verb or alias).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ServiceParameter {
    Id(EntityId),
    Name(String),
}

impl ServiceParameter {
    pub fn parse(raw: &str) -> Self {
        match EntityId::parse(raw) {
            Some(id) => ServiceParameter::Id(id),
            None => ServiceParameter::Name(raw.trim().to_string()),
        }
    }

    pub fn id(&self) -> Option<&EntityId> {
        match self {
            ServiceParameter::Id(id) => Some(id),
            ServiceParameter::Name(_) => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            ServiceParameter::Name(name) => Some(name),
            ServiceParameter::Id(_) => None,
        }
    }
}

impl From<String> for ServiceParameter {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<&str> for ServiceParameter {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<EntityId> for ServiceParameter {
    fn from(id: EntityId) -> Self {
        ServiceParameter::Id(id)
    }
}

impl From<ServiceParameter> for String {
    fn from(param: ServiceParameter) -> Self {
        param.to_string()
    }
}

impl fmt::Display for ServiceParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceParameter::Id(id) => write!(f, "{id}"),
            ServiceParameter::Name(name) => f.write_str(name),
        }
    }
}

// ── Payload ───────────────────────────────────────────────────────

/// A single property map, or a sequence of them for batch operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServicePayload {
    #[default]
    None,
    Single(Map<String, Value>),
    Batch(Vec<Map<String, Value>>),
}

impl ServicePayload {
    /// Elements in submission order. `None` yields nothing.
    pub fn into_elements(self) -> Vec<Map<String, Value>> {
        match self {
            ServicePayload::None => Vec::new(),
            ServicePayload::Single(map) => vec![map],
            ServicePayload::Batch(maps) => maps,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ServicePayload::None => 0,
            ServicePayload::Single(_) => 1,
            ServicePayload::Batch(maps) => maps.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, ServicePayload::Batch(_))
    }
}

// ── Request ───────────────────────────────────────────────────────

/// `{action, path[], payload | payload[]}` plus paging for list actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub action: ServiceAction,
    pub path: Vec<ServiceParameter>,
    #[serde(default)]
    pub payload: ServicePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

impl ServiceRequest {
    pub fn new<I, P>(action: ServiceAction, path: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ServiceParameter>,
    {
        Self {
            action,
            path: path.into_iter().map(Into::into).collect(),
            payload: ServicePayload::None,
            limit: None,
            cursor: None,
        }
    }

    pub fn with_payload(mut self, payload: ServicePayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_page(mut self, limit: Option<usize>, cursor: Option<String>) -> Self {
        self.limit = limit;
        self.cursor = cursor;
        self
    }

    pub fn page(&self) -> PageRequest {
        PageRequest {
            limit: self.limit,
            cursor: self.cursor.clone(),
        }
    }

    /// `/`-joined path for logs and errors.
    pub fn path_string(&self) -> String {
        self.path
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("/")
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────

/// Per-request state machine:
/// `Received → Authorizing → {Authorized → Executing → {Completed, Failed}, Denied}`.
///
/// `Failed` is also reachable from `Received` and `Authorizing` when the
/// path cannot be resolved or the permission lookup itself errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Received,
    Authorizing,
    Authorized,
    Executing,
    Completed,
    Failed,
    Denied,
}

impl RequestState {
    pub fn can_transition(self, to: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, to),
            (Received, Authorizing)
                | (Received, Failed)
                | (Authorizing, Authorized)
                | (Authorizing, Denied)
                | (Authorizing, Failed)
                | (Authorized, Executing)
                | (Authorized, Failed)
                | (Executing, Completed)
                | (Executing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Denied
        )
    }

    /// Move to `to`, rejecting edges the state machine does not have.
    pub fn advance(&mut self, to: RequestState) -> Result<()> {
        if !self.can_transition(to) {
            return Err(ServiceError::IllegalTransition { from: *self, to });
        }
        *self = to;
        Ok(())
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Received => "received",
            RequestState::Authorizing => "authorizing",
            RequestState::Authorized => "authorized",
            RequestState::Executing => "executing",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
            RequestState::Denied => "denied",
        };
        f.write_str(name)
    }
}
