// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Async operation records.

use std::sync::Arc;

use async_trait::async_trait;
use cirrus_store::{
    Collection, DocumentStore, Options, RetryPolicy, StoreError, retry_on_precondition_failed,
};

use crate::api::AsyncOperationDocument;
use crate::database::RepositoryConfig;
use crate::error::{Error, Result};

/// Collection holding [`AsyncOperationDocument`]s.
pub const ASYNC_OPERATIONS_COLLECTION: &str = "AsyncOperations";

/// Mutation applied inside a read-modify-write loop. It may run more than
/// once, against fresh data each time.
pub type AsyncOperationMutator<'a> =
    dyn Fn(&mut AsyncOperationDocument) -> Result<()> + Send + Sync + 'a;

/// Writer side of async operation tracking, as used by the worker pool.
#[async_trait]
pub trait AsyncOperationTracker: Send + Sync {
    /// Read, mutate and conditionally replace the operation `id`, retrying on
    /// lost races.
    async fn patch(
        &self,
        id: &str,
        mutator: &AsyncOperationMutator<'_>,
    ) -> Result<AsyncOperationDocument>;
}

/// Store-backed async operation repository.
#[derive(Debug, Clone)]
pub struct AsyncOperations {
    collection: Collection<AsyncOperationDocument>,
    retry: RetryPolicy,
}

impl AsyncOperations {
    /// Bind to the async operations collection.
    pub fn new(store: Arc<dyn DocumentStore>, config: &RepositoryConfig) -> Self {
        Self {
            collection: Collection::new(store, ASYNC_OPERATIONS_COLLECTION)
                .with_request_timeout(config.request_timeout),
            retry: config.retry,
        }
    }

    /// Insert a new operation. An existing id is reported as `PreconditionFailed`.
    pub async fn create(&self, doc: &AsyncOperationDocument) -> Result<AsyncOperationDocument> {
        self.collection
            .create(&doc.id, doc, &Options::new())
            .await
            .map_err(|e| match e {
                StoreError::Conflict => StoreError::PreconditionFailed.into(),
                e => e.into(),
            })
    }

    /// Point read by id.
    pub async fn get(&self, id: &str) -> Result<AsyncOperationDocument> {
        Ok(self.collection.get(id, id).await?)
    }
}

#[async_trait]
impl AsyncOperationTracker for AsyncOperations {
    async fn patch(
        &self,
        id: &str,
        mutator: &AsyncOperationMutator<'_>,
    ) -> Result<AsyncOperationDocument> {
        retry_on_precondition_failed(&self.retry, move || async move {
            let mut doc = self.get(id).await?;
            mutator(&mut doc)?;
            self.collection
                .replace(id, &doc, &Options::new())
                .await
                .map_err(Error::from)
        })
        .await
    }
}
