//! The storage backend contract.

use async_trait::async_trait;

use crate::client::StoreError;

/// One key/value pair returned from a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub key: String,
    pub value: String,
}

/// A single write inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: String, value: String },
    Delete { key: String },
}

impl BatchOp {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Wide-column style storage: point reads and writes, ordered prefix scans,
/// and batches whose writes are individually atomic.
///
/// Keys sort in byte order. A batch gives no cross-key atomicity guarantee;
/// callers must keep each write idempotent.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Write `value` only if the current value equals `expected`
    /// (`None` = key absent). Returns whether the write happened.
    async fn put_if(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
    ) -> Result<bool, StoreError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Cells whose key starts with `prefix` and sorts strictly after `after`,
    /// in key order, at most `limit` of them.
    async fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Cell>, StoreError>;

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;
}
