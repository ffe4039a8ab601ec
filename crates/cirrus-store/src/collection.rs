// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed collection facade over a [`DocumentStore`] driver.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::document::{Document, Options};
use crate::error::{Result, StoreError};
use crate::persistence::DocumentStore;
use crate::query::Filter;
use crate::trigger::Trigger;

/// Default deadline applied to each store call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default page size for queries.
pub const DEFAULT_MAX_ITEM_COUNT: usize = 100;

/// A named collection of `T` documents.
///
/// Every call is bounded by the request timeout; an elapsed deadline yields
/// [`StoreError::Timeout`] and the write, if any, may or may not have landed.
pub struct Collection<T> {
    store: Arc<dyn DocumentStore>,
    name: String,
    request_timeout: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            name: self.name.clone(),
            request_timeout: self.request_timeout,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("driver", &self.store.driver())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

async fn bounded<R>(
    operation: &'static str,
    timeout: Duration,
    call: impl Future<Output = Result<R>>,
) -> Result<R> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| StoreError::Timeout { operation, timeout })?
}

impl<T: Document> Collection<T> {
    /// Bind a collection name on a store.
    pub fn new(store: Arc<dyn DocumentStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            _marker: PhantomData,
        }
    }

    /// Override the per-call deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a pre-write trigger.
    pub async fn create_trigger(&self, trigger: &Trigger) -> Result<()> {
        bounded(
            "create_trigger",
            self.request_timeout,
            self.store.create_trigger(&self.name, trigger),
        )
        .await
    }

    /// Insert a new document.
    pub async fn create(&self, partition_key: &str, doc: &T, options: &Options) -> Result<T> {
        let body = serde_json::to_value(doc)?;
        let stored = bounded(
            "create",
            self.request_timeout,
            self.store.create(&self.name, partition_key, body, options),
        )
        .await?;
        Ok(serde_json::from_value(stored)?)
    }

    /// Point read by id.
    pub async fn get(&self, partition_key: &str, id: &str) -> Result<T> {
        let stored = bounded(
            "get",
            self.request_timeout,
            self.store.get(&self.name, partition_key, id),
        )
        .await?;
        Ok(serde_json::from_value(stored)?)
    }

    /// Write `doc` over the stored version.
    ///
    /// Unless `options.no_etag` is set, the document must carry the version
    /// token it was read with, and the write fails with
    /// [`StoreError::PreconditionFailed`] if that token is stale.
    pub async fn replace(&self, partition_key: &str, doc: &T, options: &Options) -> Result<T> {
        let if_match = if options.no_etag {
            None
        } else {
            Some(doc.etag().map(str::to_string).ok_or_else(|| {
                StoreError::InvalidDocument(format!(
                    "document '{}' has no version token to replace against",
                    doc.id()
                ))
            })?)
        };
        let body = serde_json::to_value(doc)?;
        let stored = bounded(
            "replace",
            self.request_timeout,
            self.store
                .replace(&self.name, partition_key, body, if_match.as_deref(), options),
        )
        .await?;
        Ok(serde_json::from_value(stored)?)
    }

    /// Remove a document, checking its version token unless `options.no_etag` is set.
    pub async fn delete(&self, partition_key: &str, doc: &T, options: &Options) -> Result<()> {
        let if_match = if options.no_etag { None } else { doc.etag() };
        bounded(
            "delete",
            self.request_timeout,
            self.store
                .delete(&self.name, partition_key, doc.id(), if_match),
        )
        .await
    }

    /// Lazily page through documents matching `filter`, optionally within one partition.
    pub fn query(&self, partition_key: Option<&str>, filter: Filter) -> DocumentIterator<T> {
        DocumentIterator {
            collection: self.clone(),
            partition_key: partition_key.map(str::to_string),
            filter,
            continuation: None,
            max_item_count: DEFAULT_MAX_ITEM_COUNT,
            done: false,
        }
    }

    /// Drain a query into a single vector.
    pub async fn query_all(&self, partition_key: Option<&str>, filter: Filter) -> Result<Vec<T>> {
        let mut iter = self.query(partition_key, filter);
        let mut all = Vec::new();
        while let Some(page) = iter.next().await? {
            all.extend(page);
        }
        Ok(all)
    }
}

/// A restartable, page-at-a-time query result.
///
/// `next` yields pages until the result set is exhausted. The position can be
/// saved with [`continuation`](Self::continuation) and restored on a fresh
/// iterator with [`resume_from`](Self::resume_from).
pub struct DocumentIterator<T> {
    collection: Collection<T>,
    partition_key: Option<String>,
    filter: Filter,
    continuation: Option<String>,
    max_item_count: usize,
    done: bool,
}

impl<T: Document> DocumentIterator<T> {
    /// Set the page size.
    pub fn max_item_count(mut self, max_item_count: usize) -> Self {
        self.max_item_count = max_item_count.max(1);
        self
    }

    /// Continue after a previously saved position.
    pub fn resume_from(mut self, continuation: impl Into<String>) -> Self {
        self.continuation = Some(continuation.into());
        self.done = false;
        self
    }

    /// Position after the last page returned, if more remain.
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// Fetch the next page, or `None` once exhausted.
    pub async fn next(&mut self) -> Result<Option<Vec<T>>> {
        if self.done {
            return Ok(None);
        }
        let collection = &self.collection;
        let page = bounded(
            "query",
            collection.request_timeout,
            collection.store.query(
                &collection.name,
                self.partition_key.as_deref(),
                &self.filter,
                self.continuation.as_deref(),
                self.max_item_count,
            ),
        )
        .await?;

        self.continuation = page.continuation;
        self.done = self.continuation.is_none();
        if page.documents.is_empty() && self.done {
            return Ok(None);
        }
        let docs = page
            .documents
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<T>, _>>()?;
        Ok(Some(docs))
    }
}
