// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Document store drivers.
//!
//! This module defines the driver abstraction and its implementations. Drivers
//! work on raw JSON bodies; [`Collection`](crate::Collection) layers typing,
//! version-token handling and request deadlines on top.

pub mod memory;
pub mod postgres;
pub mod sqlite;
mod sql;

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::document::Options;
use crate::error::{Result, StoreError};
use crate::query::Filter;
use crate::trigger::Trigger;

/// One page of query results.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    /// Bodies in `(partition_key, id)` order, with system properties stamped.
    pub documents: Vec<Value>,
    /// Token for the next page, `None` when the result set is exhausted.
    pub continuation: Option<String>,
}

/// Driver contract for a versioned document store.
///
/// Every body carries a string `id`. Writes replace the whole body and assign
/// a fresh version token; reads return the body with `_etag` and `_ts` set.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Driver identifier (e.g., "memory", "sqlite", "postgres").
    fn driver(&self) -> &'static str;

    /// Register a pre-write trigger. Fails with `Conflict` if the id is taken.
    async fn create_trigger(&self, collection: &str, trigger: &Trigger) -> Result<()>;

    /// Insert a new document. Fails with `Conflict` if the id exists in the partition.
    async fn create(
        &self,
        collection: &str,
        partition_key: &str,
        body: Value,
        options: &Options,
    ) -> Result<Value>;

    /// Point read by id.
    async fn get(&self, collection: &str, partition_key: &str, id: &str) -> Result<Value>;

    /// Replace an existing document.
    ///
    /// With `if_match` set, the write only lands if the stored version token
    /// equals it; otherwise it fails with `PreconditionFailed` and nothing changes.
    async fn replace(
        &self,
        collection: &str,
        partition_key: &str,
        body: Value,
        if_match: Option<&str>,
        options: &Options,
    ) -> Result<Value>;

    /// Remove a document, conditionally on `if_match` when set.
    async fn delete(
        &self,
        collection: &str,
        partition_key: &str,
        id: &str,
        if_match: Option<&str>,
    ) -> Result<()>;

    /// Fetch one page of documents matching `filter`, optionally restricted to
    /// a partition, resuming after `continuation`.
    async fn query(
        &self,
        collection: &str,
        partition_key: Option<&str>,
        filter: &Filter,
        continuation: Option<&str>,
        max_item_count: usize,
    ) -> Result<QueryPage>;
}

/// Open a driver from a URL.
///
/// - `memory:` - process-local store
/// - `sqlite:<path>` / `sqlite::memory:` - SQLite file (created if missing) or in-memory database
/// - `postgres://...` / `postgresql://...` - PostgreSQL
///
/// SQL drivers run their migrations before returning.
pub async fn connect(url: &str) -> Result<Arc<dyn DocumentStore>> {
    if url == "memory:" || url == "memory" {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if url.starts_with("sqlite:") {
        return Ok(Arc::new(SqliteStore::connect(url).await?));
    }
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        return Ok(Arc::new(PostgresStore::connect(url).await?));
    }
    Err(StoreError::InvalidQuery(format!(
        "unsupported database URL scheme in '{}'",
        url.split(':').next().unwrap_or_default()
    )))
}
