// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster document repository.
//!
//! Adds the work-queue protocol on top of the store: a scan-and-claim
//! [`dequeue`](ClusterRepository::dequeue), lease renewal through the
//! `renewLease` trigger, and lease-guarded patches.
//!
//! Every write is a compare-and-swap on the document's version token. Only
//! one claim per document can land in a given contention window, so at most
//! one worker holds an unexpired lease on it.

use std::sync::Arc;

use cirrus_store::{
    Collection, DocumentIterator, DocumentStore, Filter, Options, RetryPolicy, StoreError, Trigger,
    TriggerOperation, retry_on_precondition_failed,
};
use tracing::{debug, info};

use crate::api::{ClusterDocument, ProvisioningState, cluster_document_id};
use crate::database::RepositoryConfig;
use crate::error::{Error, Result};
use crate::resource_id::{check_lowercase, partition_key};

/// Collection holding [`ClusterDocument`]s.
pub const CLUSTERS_COLLECTION: &str = "Clusters";

/// Trigger that stamps `leaseExpires = now + lease TTL` on write.
pub const RENEW_LEASE_TRIGGER: &str = "renewLease";

const STATE_FIELD: &str = "cluster.properties.provisioningState";
const LEASE_EXPIRES_FIELD: &str = "leaseExpires";

/// Mutation applied inside a read-modify-write loop. It may run more than
/// once, against fresh data each time.
pub type ClusterMutator<'a> = dyn Fn(&mut ClusterDocument) -> Result<()> + Send + Sync + 'a;

/// Store-backed cluster repository for one worker instance.
#[derive(Debug, Clone)]
pub struct ClusterRepository {
    collection: Collection<ClusterDocument>,
    instance_id: String,
    retry: RetryPolicy,
}

impl ClusterRepository {
    /// Bind to the clusters collection and register the lease trigger.
    ///
    /// Registration is idempotent: an already registered trigger is kept.
    pub async fn new(
        store: Arc<dyn DocumentStore>,
        instance_id: impl Into<String>,
        config: &RepositoryConfig,
    ) -> Result<Self> {
        let collection = Collection::new(store, CLUSTERS_COLLECTION)
            .with_request_timeout(config.request_timeout);

        let trigger = Trigger::set_epoch_offset(
            RENEW_LEASE_TRIGGER,
            TriggerOperation::All,
            LEASE_EXPIRES_FIELD,
            config.lease_ttl.as_secs() as i64,
        );
        match collection.create_trigger(&trigger).await {
            Ok(()) => info!(
                trigger = RENEW_LEASE_TRIGGER,
                lease_ttl_secs = config.lease_ttl.as_secs(),
                "Registered lease trigger"
            ),
            Err(StoreError::Conflict) => {
                debug!(trigger = RENEW_LEASE_TRIGGER, "Lease trigger already registered")
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            collection,
            instance_id: instance_id.into(),
            retry: config.retry,
        })
    }

    /// Identity this repository writes into `leaseOwner`.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Insert a new document, deriving its partition key and id from the key.
    ///
    /// A document already stored for the key is reported as `PreconditionFailed`.
    pub async fn create(&self, doc: &ClusterDocument) -> Result<ClusterDocument> {
        check_lowercase(&doc.key)?;
        let mut doc = doc.clone();
        doc.partition_key = partition_key(&doc.key)?;
        doc.id = cluster_document_id(&doc.key);

        self.collection
            .create(&doc.partition_key, &doc, &Options::new())
            .await
            .map_err(|e| match e {
                StoreError::Conflict => StoreError::PreconditionFailed.into(),
                e => e.into(),
            })
    }

    /// Look up a document by key within its partition.
    ///
    /// More than one match is a data-integrity violation and fails with
    /// `AmbiguousResult` rather than picking one.
    pub async fn get(&self, key: &str) -> Result<ClusterDocument> {
        check_lowercase(key)?;
        let partition = partition_key(key)?;

        let mut docs = self
            .collection
            .query_all(Some(&partition), Filter::eq("key", key))
            .await?;
        match docs.len() {
            0 => Err(StoreError::NotFound.into()),
            1 => Ok(docs.remove(0)),
            count => Err(StoreError::AmbiguousResult { count }.into()),
        }
    }

    /// Read-modify-write `key`, retrying the whole cycle on lost races.
    pub async fn patch<F>(&self, key: &str, mutator: F) -> Result<ClusterDocument>
    where
        F: Fn(&mut ClusterDocument) -> Result<()> + Send + Sync,
    {
        self.patch_with_options(key, &mutator, &Options::new()).await
    }

    /// Like [`patch`](Self::patch), but fails with `LeaseLost` without applying
    /// `mutator` unless this instance owns the lease.
    pub async fn patch_with_lease<F>(&self, key: &str, mutator: F) -> Result<ClusterDocument>
    where
        F: Fn(&mut ClusterDocument) -> Result<()> + Send + Sync,
    {
        self.patch_with_options(key, &self.lease_guarded(&mutator), &Options::new())
            .await
    }

    fn lease_guarded<'a>(
        &'a self,
        mutator: &'a ClusterMutator<'a>,
    ) -> impl Fn(&mut ClusterDocument) -> Result<()> + Send + Sync + 'a {
        move |doc: &mut ClusterDocument| {
            if doc.lease_owner.as_deref() != Some(self.instance_id.as_str()) {
                return Err(Error::LeaseLost);
            }
            mutator(doc)
        }
    }

    async fn patch_with_options(
        &self,
        key: &str,
        mutator: &ClusterMutator<'_>,
        options: &Options,
    ) -> Result<ClusterDocument> {
        retry_on_precondition_failed(&self.retry, move || async move {
            let mut doc = self.get(key).await?;
            mutator(&mut doc)?;
            self.update_with_options(&doc, options).await
        })
        .await
    }

    /// Replace a caller-held document against the version token it was read with.
    pub async fn update(&self, doc: &ClusterDocument) -> Result<ClusterDocument> {
        self.update_with_options(doc, &Options::new()).await
    }

    async fn update_with_options(
        &self,
        doc: &ClusterDocument,
        options: &Options,
    ) -> Result<ClusterDocument> {
        check_lowercase(&doc.key)?;
        Ok(self
            .collection
            .replace(&doc.partition_key, doc, options)
            .await?)
    }

    /// Remove a document. Version tokens are not checked on delete.
    pub async fn delete(&self, doc: &ClusterDocument) -> Result<()> {
        check_lowercase(&doc.key)?;
        self.collection
            .delete(&doc.partition_key, doc, &Options::new().without_etag())
            .await?;
        Ok(())
    }

    /// Lazily list documents in a subscription whose key starts with `prefix`.
    pub fn list_by_prefix(
        &self,
        subscription_id: &str,
        prefix: &str,
    ) -> Result<DocumentIterator<ClusterDocument>> {
        check_lowercase(prefix)?;
        Ok(self
            .collection
            .query(Some(subscription_id), Filter::starts_with("key", prefix)))
    }

    /// Claim one document that needs work.
    ///
    /// Candidates are documents not in a terminal state whose lease has
    /// expired, by the store's clock. Each is claimed with a conditional
    /// write that sets `leaseOwner`, bumps `dequeues` and stamps a fresh
    /// expiry; a candidate lost to another worker is skipped, not retried.
    /// Returns `None` when nothing could be claimed.
    pub async fn dequeue(&self) -> Result<Option<ClusterDocument>> {
        let filter = Filter::and([
            Filter::not_in(
                STATE_FIELD,
                [
                    ProvisioningState::Succeeded.as_str(),
                    ProvisioningState::Failed.as_str(),
                ],
            ),
            Filter::before_now(LEASE_EXPIRES_FIELD),
        ]);
        let renew = Options::new().pre_trigger(RENEW_LEASE_TRIGGER);

        let mut candidates = self.collection.query(None, filter);
        while let Some(page) = candidates.next().await? {
            for mut doc in page {
                doc.lease_owner = Some(self.instance_id.clone());
                doc.dequeues += 1;

                match self.update_with_options(&doc, &renew).await {
                    Ok(claimed) => return Ok(Some(claimed)),
                    Err(e) if e.is_precondition_failed() => {
                        debug!(resource = %doc.key, "Lost dequeue race, skipping");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(None)
    }

    /// Renew this instance's lease on `key` without touching other fields.
    pub async fn lease(&self, key: &str) -> Result<ClusterDocument> {
        let renew = Options::new().pre_trigger(RENEW_LEASE_TRIGGER);
        self.patch_with_options(key, &self.lease_guarded(&|_| Ok(())), &renew)
            .await
    }

    /// Release the lease and record the final state.
    ///
    /// `dequeues` resets only on success; `asyncOperationID` is always cleared.
    pub async fn end_lease(
        &self,
        key: &str,
        state: ProvisioningState,
        failed_provisioning_state: Option<ProvisioningState>,
    ) -> Result<ClusterDocument> {
        self.patch_with_lease(key, move |doc| {
            doc.cluster.properties.provisioning_state = state.clone();
            doc.cluster.properties.failed_provisioning_state = failed_provisioning_state.clone();
            doc.lease_owner = None;
            doc.lease_expires = 0;
            if state == ProvisioningState::Succeeded {
                doc.dequeues = 0;
            }
            doc.async_operation_id = None;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_store::MemoryStore;

    const SUB: &str = "7c1e9f3a-0000-4000-8000-000000000001";

    fn key(name: &str) -> String {
        format!(
            "/subscriptions/{SUB}/resourcegroups/rg/providers/microsoft.redhatopenshift/openshiftclusters/{name}"
        )
    }

    async fn repository(store: Arc<MemoryStore>, instance: &str) -> ClusterRepository {
        ClusterRepository::new(store, instance, &RepositoryConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_derives_partition_key_and_get_by_key() {
        let repo = repository(Arc::new(MemoryStore::new()), "w1").await;
        let created = repo
            .create(&ClusterDocument::new(key("a"), ProvisioningState::Creating))
            .await
            .unwrap();
        assert_eq!(created.partition_key, SUB);

        let fetched = repo.get(&key("a")).await.unwrap();
        assert_eq!(fetched.id, created.id);
        assert!(repo.get(&key("b")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_existing_is_precondition_failed() {
        let repo = repository(Arc::new(MemoryStore::new()), "w1").await;
        let doc = ClusterDocument::new(key("a"), ProvisioningState::Creating);
        repo.create(&doc).await.unwrap();
        assert!(repo.create(&doc).await.unwrap_err().is_precondition_failed());
    }

    #[tokio::test]
    async fn test_same_key_cannot_be_created_twice() {
        let store = Arc::new(MemoryStore::new());
        let w1 = repository(store.clone(), "w1").await;
        let w2 = repository(store, "w2").await;
        w1.create(&ClusterDocument::new(key("dup"), ProvisioningState::Creating))
            .await
            .unwrap();

        // A caller-chosen id does not get around the key check.
        let mut again = ClusterDocument::new(key("dup"), ProvisioningState::Creating);
        again.id = "another-id".to_string();
        assert!(w2.create(&again).await.unwrap_err().is_precondition_failed());

        assert!(w1.dequeue().await.unwrap().is_some());
        assert!(w2.dequeue().await.unwrap().is_none());
        assert_eq!(w1.get(&key("dup")).await.unwrap().lease_owner.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_duplicate_keys_are_ambiguous() {
        let store = Arc::new(MemoryStore::new());
        let repo = repository(store.clone(), "w1").await;
        // Bypass the repository to plant a second document for the same key.
        for id in ["first", "second"] {
            let mut body =
                serde_json::to_value(ClusterDocument::new(key("a"), ProvisioningState::Creating))
                    .unwrap();
            body["id"] = serde_json::json!(id);
            store
                .create(CLUSTERS_COLLECTION, SUB, body, &Options::new())
                .await
                .unwrap();
        }

        let err = repo.get(&key("a")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Store(StoreError::AmbiguousResult { count: 2 })
        ));
    }

    #[tokio::test]
    async fn test_rejects_non_canonical_keys() {
        let repo = repository(Arc::new(MemoryStore::new()), "w1").await;
        let upper = key("A");
        assert!(matches!(
            repo.create(&ClusterDocument::new(&upper, ProvisioningState::Creating))
                .await,
            Err(Error::InvalidKey(_))
        ));
        assert!(matches!(repo.get(&upper).await, Err(Error::InvalidKey(_))));
        assert!(matches!(
            repo.list_by_prefix(SUB, "/Subscriptions/"),
            Err(Error::InvalidKey(_))
        ));
        assert!(matches!(
            repo.get("/not/a/resource").await,
            Err(Error::InvalidResourceId(_))
        ));
    }

    #[tokio::test]
    async fn test_trigger_registration_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        repository(store.clone(), "w1").await;
        repository(store, "w2").await;
    }

    #[tokio::test]
    async fn test_dequeue_claims_and_stamps_lease() {
        let repo = repository(Arc::new(MemoryStore::new()), "w1").await;
        repo.create(&ClusterDocument::new(key("a"), ProvisioningState::Creating))
            .await
            .unwrap();

        let claimed = repo.dequeue().await.unwrap().unwrap();
        assert_eq!(claimed.lease_owner.as_deref(), Some("w1"));
        assert_eq!(claimed.dequeues, 1);
        assert_eq!(claimed.lease_expires, claimed.ts.unwrap() + 60);

        // Leased now, so nothing else is eligible.
        assert!(repo.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_skips_terminal_states() {
        let repo = repository(Arc::new(MemoryStore::new()), "w1").await;
        for (name, state) in [
            ("s", ProvisioningState::Succeeded),
            ("f", ProvisioningState::Failed),
        ] {
            repo.create(&ClusterDocument::new(key(name), state))
                .await
                .unwrap();
        }
        assert!(repo.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_requires_ownership() {
        let store = Arc::new(MemoryStore::new());
        let w1 = repository(store.clone(), "w1").await;
        let w2 = repository(store, "w2").await;
        w1.create(&ClusterDocument::new(key("a"), ProvisioningState::Creating))
            .await
            .unwrap();
        let claimed = w1.dequeue().await.unwrap().unwrap();

        let renewed = w1.lease(&key("a")).await.unwrap();
        assert_ne!(renewed.etag, claimed.etag);
        assert!(w2.lease(&key("a")).await.unwrap_err().is_lease_lost());
    }

    #[tokio::test]
    async fn test_patch_with_lease_leaves_document_unchanged_when_not_owner() {
        let store = Arc::new(MemoryStore::new());
        let w1 = repository(store.clone(), "w1").await;
        let w2 = repository(store, "w2").await;
        w1.create(&ClusterDocument::new(key("a"), ProvisioningState::Creating))
            .await
            .unwrap();
        let claimed = w1.dequeue().await.unwrap().unwrap();

        let err = w2
            .patch_with_lease(&key("a"), |doc| {
                doc.set_state(ProvisioningState::Succeeded);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.is_lease_lost());

        let current = w1.get(&key("a")).await.unwrap();
        assert_eq!(current, claimed);
    }

    #[tokio::test]
    async fn test_end_lease() {
        let repo = repository(Arc::new(MemoryStore::new()), "w1").await;
        let mut doc = ClusterDocument::new(key("a"), ProvisioningState::Creating);
        doc.async_operation_id = Some("op".to_string());
        repo.create(&doc).await.unwrap();

        repo.dequeue().await.unwrap().unwrap();
        let failed = repo
            .end_lease(
                &key("a"),
                ProvisioningState::Failed,
                Some(ProvisioningState::Creating),
            )
            .await
            .unwrap();
        assert_eq!(failed.state(), &ProvisioningState::Failed);
        assert_eq!(
            failed.cluster.properties.failed_provisioning_state,
            Some(ProvisioningState::Creating)
        );
        assert!(failed.lease_owner.is_none());
        assert_eq!(failed.lease_expires, 0);
        assert_eq!(failed.dequeues, 1);
        assert!(failed.async_operation_id.is_none());

        // A released lease cannot be ended twice.
        assert!(
            repo.end_lease(&key("a"), ProvisioningState::Succeeded, None)
                .await
                .unwrap_err()
                .is_lease_lost()
        );
    }

    #[tokio::test]
    async fn test_end_lease_success_resets_dequeues() {
        let repo = repository(Arc::new(MemoryStore::new()), "w1").await;
        repo.create(&ClusterDocument::new(key("a"), ProvisioningState::Updating))
            .await
            .unwrap();
        repo.dequeue().await.unwrap().unwrap();

        let done = repo
            .end_lease(&key("a"), ProvisioningState::Succeeded, None)
            .await
            .unwrap();
        assert_eq!(done.dequeues, 0);
        assert!(done.cluster.properties.failed_provisioning_state.is_none());
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let repo = repository(Arc::new(MemoryStore::new()), "w1").await;
        let mut doc = repo
            .create(&ClusterDocument::new(key("a"), ProvisioningState::Creating))
            .await
            .unwrap();

        doc.cluster.location = "westeurope".to_string();
        let updated = repo.update(&doc).await.unwrap();
        assert!(repo.update(&doc).await.unwrap_err().is_precondition_failed());

        // Delete ignores the version token.
        repo.delete(&doc).await.unwrap();
        assert!(repo.get(&key("a")).await.unwrap_err().is_not_found());
        assert!(repo.delete(&updated).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let repo = repository(Arc::new(MemoryStore::new()), "w1").await;
        for name in ["a1", "a2", "b1"] {
            repo.create(&ClusterDocument::new(key(name), ProvisioningState::Succeeded))
                .await
                .unwrap();
        }

        let mut iter = repo.list_by_prefix(SUB, &key("a")).unwrap().max_item_count(1);
        let mut keys = Vec::new();
        while let Some(page) = iter.next().await.unwrap() {
            keys.extend(page.into_iter().map(|d| d.key));
        }
        keys.sort();
        assert_eq!(keys, vec![key("a1"), key("a2")]);
    }
}
