//! The entity manager shared by every request.

use std::borrow::Cow;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use canopy_core::config::CanopyConfig;
use canopy_core::{Context, EntitySchema, SchemaRegistry};
use canopy_store::{BatchOp, Cell, StoreClient};

use crate::error::Result;
use crate::keys::Keys;

/// Entry point for entity, relationship and role operations.
///
/// Holds no per-request state: the tenant, principal and storage timeout of
/// each call come from the [`Context`] passed in. Clone is cheap (inner Arc).
#[derive(Clone)]
pub struct EntityManager {
    store: StoreClient,
    schemas: Arc<SchemaRegistry>,
    config: Arc<CanopyConfig>,
    last_sequence: Arc<AtomicI64>,
}

impl EntityManager {
    pub fn new(store: StoreClient, schemas: SchemaRegistry, config: CanopyConfig) -> Self {
        Self {
            store,
            schemas: Arc::new(schemas),
            config: Arc::new(config),
            last_sequence: Arc::new(AtomicI64::new(0)),
        }
    }

    /// A manager over in-memory storage with the built-in schemas.
    pub fn in_memory() -> Self {
        Self::new(
            StoreClient::memory(),
            SchemaRegistry::with_builtins(),
            CanopyConfig::default(),
        )
    }

    pub fn store(&self) -> &StoreClient {
        &self.store
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    pub fn config(&self) -> &CanopyConfig {
        &self.config
    }

    pub fn schema(&self, entity_type: &str) -> Cow<'_, EntitySchema> {
        self.schemas.resolve(entity_type)
    }

    pub(crate) fn keys(&self, ctx: &Context) -> Keys {
        Keys::new(&ctx.tenant_id)
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// A collection ordering stamp: microseconds since the epoch, bumped
    /// past the previous stamp so members added in the same microsecond
    /// keep their insertion order.
    pub(crate) fn next_sequence(&self) -> String {
        let now = self.now().timestamp_micros().max(0);
        let mut prev = self.last_sequence.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self.last_sequence.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return format!("{next:020}"),
                Err(actual) => prev = actual,
            }
        }
    }

    /// Page size used when a cleanup pass walks a whole prefix.
    pub(crate) fn sweep_size(&self) -> usize {
        self.config.entities.max_page_size.max(1)
    }

    pub(crate) async fn sweep(&self, ctx: &Context, prefix: &str) -> Result<Vec<Cell>> {
        Ok(self
            .store
            .scan_all(prefix, self.sweep_size(), ctx.timeout)
            .await?)
    }

    pub(crate) async fn apply(&self, ctx: &Context, ops: Vec<BatchOp>) -> Result<()> {
        Ok(self.store.batch(ops, ctx.timeout).await?)
    }
}
