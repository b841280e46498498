//! Neo4j-backed storage.
//!
//! Each cell is a `(:Cell {key, value})` node with a uniqueness constraint
//! on `key`. Insert-if-absent is a MERGE; compare-and-set takes the node's
//! write lock (a throwaway `SET`) before comparing, so two writers cannot
//! both see the expected value.

use async_trait::async_trait;
use neo4rs::{query, ConfigBuilder, Graph, Query};
use uuid::Uuid;

use canopy_core::config::Neo4jSettings;

use crate::backend::{BatchOp, Cell, Storage};
use crate::client::StoreError;

/// Thread-safe Neo4j storage with connection pooling. Clone is cheap.
#[derive(Clone)]
pub struct Neo4jStorage {
    graph: Graph,
}

impl Neo4jStorage {
    /// Connect to Neo4j and make sure the key constraint exists.
    pub async fn connect(settings: &Neo4jSettings) -> Result<Self, StoreError> {
        let neo_config = ConfigBuilder::default()
            .uri(&settings.uri)
            .user(&settings.user)
            .password(&settings.password)
            .max_connections(settings.max_connections as usize)
            .fetch_size(settings.fetch_size)
            .build()
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let graph = Graph::connect(neo_config)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let storage = Self { graph };
        storage
            .run(query(
                "CREATE CONSTRAINT cell_key IF NOT EXISTS FOR (c:Cell) REQUIRE c.key IS UNIQUE",
            ))
            .await?;

        tracing::info!(uri = %settings.uri, "Connected to Neo4j");
        Ok(storage)
    }

    /// Get a reference to the underlying neo4rs Graph for direct operations.
    pub fn inner(&self) -> &Graph {
        &self.graph
    }

    async fn run(&self, q: Query) -> Result<(), StoreError> {
        self.graph.run(q).await?;
        Ok(())
    }

    async fn query_rows(&self, q: Query) -> Result<Vec<neo4rs::Row>, StoreError> {
        let mut stream = self.graph.execute(q).await?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    async fn query_one(&self, q: Query) -> Result<Option<neo4rs::Row>, StoreError> {
        let mut stream = self.graph.execute(q).await?;
        Ok(stream.next().await?)
    }
}

fn column<T: serde::de::DeserializeOwned>(row: &neo4rs::Row, name: &str) -> Result<T, StoreError> {
    row.get::<T>(name)
        .map_err(|e| StoreError::Serialization(format!("column {name}: {e}")))
}

#[async_trait]
impl Storage for Neo4jStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let q = query("MATCH (c:Cell {key: $key}) RETURN c.value AS value").param("key", key);
        match self.query_one(q).await? {
            Some(row) => Ok(Some(column(&row, "value")?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        let q = query("MERGE (c:Cell {key: $key}) SET c.value = $value")
            .param("key", key)
            .param("value", value);
        self.run(q).await
    }

    async fn put_if(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
    ) -> Result<bool, StoreError> {
        match expected {
            None => {
                let writer = Uuid::new_v4().to_string();
                let q = query(
                    "MERGE (c:Cell {key: $key})
                     ON CREATE SET c.value = $value, c.writer = $writer
                     RETURN c.writer = $writer AS applied",
                )
                .param("key", key)
                .param("value", value)
                .param("writer", writer);
                match self.query_one(q).await? {
                    Some(row) => column(&row, "applied"),
                    None => Ok(false),
                }
            }
            Some(expected) => {
                let q = query(
                    "MATCH (c:Cell {key: $key})
                     SET c._lock = true
                     WITH c, c.value = $expected AS hit
                     FOREACH (_ IN CASE WHEN hit THEN [1] ELSE [] END | SET c.value = $value)
                     REMOVE c._lock
                     RETURN hit AS applied",
                )
                .param("key", key)
                .param("expected", expected)
                .param("value", value);
                match self.query_one(q).await? {
                    Some(row) => column(&row, "applied"),
                    None => Ok(false),
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.run(query("MATCH (c:Cell {key: $key}) DELETE c").param("key", key))
            .await
    }

    async fn scan(
        &self,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Cell>, StoreError> {
        let q = query(
            "MATCH (c:Cell)
             WHERE c.key STARTS WITH $prefix AND c.key > $after
             RETURN c.key AS key, c.value AS value
             ORDER BY c.key
             LIMIT $limit",
        )
        .param("prefix", prefix)
        .param("after", after.unwrap_or(""))
        .param("limit", limit as i64);

        self.query_rows(q)
            .await?
            .iter()
            .map(|row| {
                Ok(Cell {
                    key: column(row, "key")?,
                    value: column(row, "value")?,
                })
            })
            .collect()
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut txn = self.graph.start_txn().await?;
        for op in ops {
            let q = match op {
                BatchOp::Put { key, value } => {
                    query("MERGE (c:Cell {key: $key}) SET c.value = $value")
                        .param("key", key)
                        .param("value", value)
                }
                BatchOp::Delete { key } => {
                    query("MATCH (c:Cell {key: $key}) DELETE c").param("key", key)
                }
            };
            txn.run(q).await?;
        }
        txn.commit().await?;
        Ok(())
    }
}
