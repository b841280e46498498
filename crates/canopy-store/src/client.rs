//! Backend selection and the shared storage client.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use canopy_core::config::{StoreBackend, StoreSettings};

use crate::backend::{BatchOp, Cell, Storage};
use crate::memory::MemoryStorage;
use crate::neo4j::Neo4jStorage;

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage connection error: {0}")]
    Connection(String),

    #[error("Neo4j query error: {0}")]
    Query(#[from] neo4rs::Error),

    #[error("Storage {op} timed out after {millis}ms")]
    Timeout { op: &'static str, millis: u128 },

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// One page of a listing plus the cursor for the next page, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            cursor: None,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            cursor: self.cursor,
        }
    }
}

/// Caller-side paging parameters. `limit` is clamped by the listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize, Serialize)]
pub struct PageRequest {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<String>,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            cursor: None,
        }
    }

    pub fn after(limit: usize, cursor: impl Into<String>) -> Self {
        Self {
            limit: Some(limit),
            cursor: Some(cursor.into()),
        }
    }
}

/// Thread-safe storage client.
///
/// This is the single point of access for all entity-graph storage. Every
/// call takes a timeout and fails with [`StoreError::Timeout`] when the
/// backend does not answer in time. Clone is cheap (inner Arc).
#[derive(Clone)]
pub struct StoreClient {
    backend: Arc<dyn Storage>,
}

impl StoreClient {
    pub fn new(backend: Arc<dyn Storage>) -> Self {
        Self { backend }
    }

    /// A client over a fresh in-memory backend.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// Open the backend named in `settings`.
    pub async fn connect(settings: &StoreSettings) -> Result<Self, StoreError> {
        match settings.backend {
            StoreBackend::Memory => {
                tracing::info!("Using in-memory storage");
                Ok(Self::memory())
            }
            StoreBackend::Neo4j => {
                let storage = Neo4jStorage::connect(&settings.neo4j).await?;
                Ok(Self::new(Arc::new(storage)))
            }
        }
    }

    /// Get a reference to the underlying backend for direct operations.
    pub fn inner(&self) -> &Arc<dyn Storage> {
        &self.backend
    }

    pub async fn get(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        timed("get", timeout, self.backend.get(key)).await
    }

    pub async fn put(&self, key: &str, value: String, timeout: Duration) -> Result<(), StoreError> {
        timed("put", timeout, self.backend.put(key, value)).await
    }

    pub async fn put_if(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        timeout: Duration,
    ) -> Result<bool, StoreError> {
        timed("put_if", timeout, self.backend.put_if(key, expected, value)).await
    }

    /// Insert `value` only if `key` is absent. Returns whether it was written.
    pub async fn insert_if_absent(
        &self,
        key: &str,
        value: String,
        timeout: Duration,
    ) -> Result<bool, StoreError> {
        self.put_if(key, None, value, timeout).await
    }

    pub async fn delete(&self, key: &str, timeout: Duration) -> Result<(), StoreError> {
        timed("delete", timeout, self.backend.delete(key)).await
    }

    pub async fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
        timeout: Duration,
    ) -> Result<Vec<Cell>, StoreError> {
        timed("scan", timeout, self.backend.scan(prefix, after, limit)).await
    }

    pub async fn batch(&self, ops: Vec<BatchOp>, timeout: Duration) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        timed("batch", timeout, self.backend.batch(ops)).await
    }

    /// Every cell under `prefix`, fetched page by page.
    ///
    /// Used by cleanup paths that must see the whole prefix; listings exposed
    /// to callers go through paginated scans instead.
    pub async fn scan_all(
        &self,
        prefix: &str,
        page_size: usize,
        timeout: Duration,
    ) -> Result<Vec<Cell>, StoreError> {
        let mut cells = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = self
                .scan(prefix, after.as_deref(), page_size.max(1), timeout)
                .await?;
            let done = page.len() < page_size.max(1);
            after = page.last().map(|c| c.key.clone());
            cells.extend(page);
            if done || after.is_none() {
                return Ok(cells);
            }
        }
    }

    // ── JSON helpers ─────────────────────────────────────────────

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<T>, StoreError> {
        match self.get(key, timeout).await? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        timeout: Duration,
    ) -> Result<(), StoreError> {
        self.put(key, encode(value)?, timeout).await
    }
}

/// Serialize a record for storage.
pub fn encode<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Deserialize a stored record.
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

async fn timed<T, F>(op: &'static str, timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(op, timeout_ms = timeout.as_millis(), "Storage call timed out");
            Err(StoreError::Timeout {
                op,
                millis: timeout.as_millis(),
            })
        }
    }
}
