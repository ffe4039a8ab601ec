// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process document store.
//!
//! Every operation runs under one lock, so version checks, trigger evaluation
//! and the write itself form a single atomic step. Used for embedded
//! deployments and as the compare-and-swap reference in tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{DocumentStore, QueryPage};
use crate::document::{
    Options, document_id, new_etag, strip_system_properties, with_system_properties,
};
use crate::error::{Result, StoreError};
use crate::query::{ContinuationToken, Filter};
use crate::trigger::{self, Trigger, WriteOperation};

#[derive(Debug, Clone)]
struct Entry {
    etag: String,
    ts: i64,
    body: Value,
}

#[derive(Debug, Default)]
struct CollectionState {
    /// Keyed by `(partition_key, id)`, which is also the query order.
    documents: BTreeMap<(String, String), Entry>,
    triggers: HashMap<String, Trigger>,
}

impl CollectionState {
    fn run_triggers(
        &self,
        body: &mut Value,
        options: &Options,
        write: WriteOperation,
        now: i64,
    ) -> Result<()> {
        let triggers = trigger::resolve(|id| self.triggers.get(id), &options.pre_triggers, write)?;
        for trigger in triggers {
            trigger.apply(body, now)?;
        }
        Ok(())
    }
}

/// In-memory [`DocumentStore`]. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    collections: Arc<Mutex<HashMap<String, CollectionState>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection.
    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .await
            .get(collection)
            .map_or(0, |c| c.documents.len())
    }

    /// True if the collection holds no documents.
    pub async fn is_empty(&self, collection: &str) -> bool {
        self.len(collection).await == 0
    }
}

fn now() -> i64 {
    Utc::now().timestamp()
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn driver(&self) -> &'static str {
        "memory"
    }

    async fn create_trigger(&self, collection: &str, trigger: &Trigger) -> Result<()> {
        trigger.validate()?;
        let mut collections = self.collections.lock().await;
        let state = collections.entry(collection.to_string()).or_default();
        if state.triggers.contains_key(&trigger.id) {
            return Err(StoreError::Conflict);
        }
        state.triggers.insert(trigger.id.clone(), trigger.clone());
        Ok(())
    }

    async fn create(
        &self,
        collection: &str,
        partition_key: &str,
        mut body: Value,
        options: &Options,
    ) -> Result<Value> {
        strip_system_properties(&mut body)?;
        let id = document_id(&body)?;

        let mut collections = self.collections.lock().await;
        let state = collections.entry(collection.to_string()).or_default();
        let key = (partition_key.to_string(), id);
        if state.documents.contains_key(&key) {
            return Err(StoreError::Conflict);
        }

        let ts = now();
        state.run_triggers(&mut body, options, WriteOperation::Create, ts)?;

        let etag = new_etag();
        let returned = with_system_properties(body.clone(), &etag, ts);
        state.documents.insert(key, Entry { etag, ts, body });
        Ok(returned)
    }

    async fn get(&self, collection: &str, partition_key: &str, id: &str) -> Result<Value> {
        let collections = self.collections.lock().await;
        collections
            .get(collection)
            .and_then(|c| c.documents.get(&(partition_key.to_string(), id.to_string())))
            .map(|e| with_system_properties(e.body.clone(), &e.etag, e.ts))
            .ok_or(StoreError::NotFound)
    }

    async fn replace(
        &self,
        collection: &str,
        partition_key: &str,
        mut body: Value,
        if_match: Option<&str>,
        options: &Options,
    ) -> Result<Value> {
        strip_system_properties(&mut body)?;
        let id = document_id(&body)?;

        let mut collections = self.collections.lock().await;
        let state = collections
            .get_mut(collection)
            .ok_or(StoreError::NotFound)?;
        let key = (partition_key.to_string(), id);
        let current_etag = state
            .documents
            .get(&key)
            .map(|e| e.etag.clone())
            .ok_or(StoreError::NotFound)?;
        if let Some(expected) = if_match
            && expected != current_etag
        {
            return Err(StoreError::PreconditionFailed);
        }

        let ts = now();
        state.run_triggers(&mut body, options, WriteOperation::Replace, ts)?;

        let etag = new_etag();
        let returned = with_system_properties(body.clone(), &etag, ts);
        state.documents.insert(key, Entry { etag, ts, body });
        Ok(returned)
    }

    async fn delete(
        &self,
        collection: &str,
        partition_key: &str,
        id: &str,
        if_match: Option<&str>,
    ) -> Result<()> {
        let mut collections = self.collections.lock().await;
        let state = collections
            .get_mut(collection)
            .ok_or(StoreError::NotFound)?;
        let key = (partition_key.to_string(), id.to_string());
        let entry = state.documents.get(&key).ok_or(StoreError::NotFound)?;
        if let Some(expected) = if_match
            && expected != entry.etag
        {
            return Err(StoreError::PreconditionFailed);
        }
        state.documents.remove(&key);
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        partition_key: Option<&str>,
        filter: &Filter,
        continuation: Option<&str>,
        max_item_count: usize,
    ) -> Result<QueryPage> {
        filter.validate()?;
        if max_item_count == 0 {
            return Err(StoreError::InvalidQuery("max_item_count must be positive".into()));
        }
        let after = continuation.map(ContinuationToken::decode).transpose()?;

        let collections = self.collections.lock().await;
        let Some(state) = collections.get(collection) else {
            return Ok(QueryPage::default());
        };

        let now = now();
        let mut matched = state
            .documents
            .iter()
            .filter(|((pk, id), _)| after.as_ref().is_none_or(|t| t.precedes(pk, id)))
            .filter(|((pk, _), _)| partition_key.is_none_or(|wanted| wanted == pk))
            .filter(|(_, entry)| filter.matches(&entry.body, now))
            .take(max_item_count + 1);

        let mut page = QueryPage::default();
        let mut last = None;
        for ((pk, id), entry) in matched.by_ref().take(max_item_count) {
            page.documents
                .push(with_system_properties(entry.body.clone(), &entry.etag, entry.ts));
            last = Some((pk, id));
        }
        if matched.next().is_some()
            && let Some((pk, id)) = last
        {
            page.continuation = Some(
                ContinuationToken {
                    partition_key: pk.clone(),
                    id: id.clone(),
                }
                .encode()?,
            );
        }
        Ok(page)
    }
}
