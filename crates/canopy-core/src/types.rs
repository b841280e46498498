//! Identifier, relationship, and request-context types shared by every crate.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Tenant ────────────────────────────────────────────────────────

/// Every entity in the system belongs to a tenant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The id of the tenant's root `application` entity.
    ///
    /// Derived with UUID v5 so every process agrees on it without a lookup.
    pub fn application_id(&self) -> EntityId {
        EntityId(Uuid::new_v5(&Uuid::NAMESPACE_OID, self.0.as_bytes()))
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Entities ──────────────────────────────────────────────────────

/// Unique identifier for any entity. Never reused.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a path segment or key fragment as an entity id.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A typed pointer to an entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub id: EntityId,
    #[serde(rename = "type")]
    pub entity_type: String,
}

impl EntityRef {
    pub fn new(id: EntityId, entity_type: impl Into<String>) -> Self {
        Self {
            id,
            entity_type: entity_type.into(),
        }
    }
}

// ── Relationships ─────────────────────────────────────────────────

/// Which endpoint of a connection a listing starts from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Objects reachable from the entity as subject.
    Outgoing,
    /// Subjects pointing at the entity as object.
    Incoming,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outgoing => "out",
            Direction::Incoming => "in",
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Outgoing => Direction::Incoming,
            Direction::Incoming => Direction::Outgoing,
        }
    }
}

/// A directed, typed edge `(subject, verb, object)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connection {
    pub subject: EntityRef,
    pub verb: String,
    pub object: EntityRef,
    pub created: DateTime<Utc>,
}

// ── Request context ───────────────────────────────────────────────

/// The identity an operation runs as.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Principal {
    /// Internal caller; never subject to permission checks.
    System,
    /// An authenticated user entity.
    User(EntityId),
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::System => write!(f, "system"),
            Principal::User(id) => write!(f, "user:{id}"),
        }
    }
}

/// Cooperative cancellation flag shared between a caller and a running batch.
///
/// Clone is cheap (inner Arc).
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Per-request context passed to every operation.
///
/// Carries the tenant namespace, the acting principal, the storage timeout
/// and the cancellation signal. Lives for one request.
#[derive(Debug, Clone)]
pub struct Context {
    pub tenant_id: TenantId,
    pub principal: Principal,
    pub timeout: Duration,
    pub cancel: CancelSignal,
}

impl Context {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(tenant_id: TenantId, principal: Principal) -> Self {
        Self {
            tenant_id,
            principal,
            timeout: Self::DEFAULT_TIMEOUT,
            cancel: CancelSignal::new(),
        }
    }

    /// A system context for internal maintenance work.
    pub fn system(tenant_id: TenantId) -> Self {
        Self::new(tenant_id, Principal::System)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// The same tenant and limits, acting as a different principal.
    pub fn as_principal(&self, principal: Principal) -> Self {
        Self {
            principal,
            ..self.clone()
        }
    }
}
