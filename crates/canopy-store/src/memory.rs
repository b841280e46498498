//! In-process storage backend.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::backend::{BatchOp, Cell, Storage};
use crate::client::StoreError;

/// Ordered in-memory map. Used for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    cells: RwLock<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every key currently stored, in order.
    pub fn keys(&self) -> Vec<String> {
        self.cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let cells = self.cells.read().unwrap_or_else(PoisonError::into_inner);
        Ok(cells.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        cells.insert(key.to_string(), value);
        Ok(())
    }

    async fn put_if(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
    ) -> Result<bool, StoreError> {
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        if cells.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        cells.insert(key.to_string(), value);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        cells.remove(key);
        Ok(())
    }

    async fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Cell>, StoreError> {
        let cells = self.cells.read().unwrap_or_else(PoisonError::into_inner);
        let lower = match after {
            Some(after) if after >= prefix => Bound::Excluded(after.to_string()),
            _ => Bound::Included(prefix.to_string()),
        };
        Ok(cells
            .range((lower, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| Cell {
                key: k.clone(),
                value: v.clone(),
            })
            .collect())
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    cells.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    cells.remove(&key);
                }
            }
        }
        Ok(())
    }
}
