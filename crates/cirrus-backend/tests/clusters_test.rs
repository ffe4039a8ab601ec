// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster repository behaviour under contention between worker instances.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cirrus_backend::api::{ClusterDocument, ProvisioningState};
use cirrus_backend::database::{ClusterRepository, RepositoryConfig};
use cirrus_store::{DocumentStore, MemoryStore, SqliteStore};
use futures::future::join_all;
use serde_json::json;

use common::cluster_key;

async fn workers(
    store: Arc<dyn DocumentStore>,
    n: usize,
    config: &RepositoryConfig,
) -> Vec<ClusterRepository> {
    let mut repos = Vec::new();
    for i in 0..n {
        repos.push(
            ClusterRepository::new(store.clone(), format!("worker-{i}"), config)
                .await
                .unwrap(),
        );
    }
    repos
}

async fn assert_each_document_claimed_once(store: Arc<dyn DocumentStore>) {
    let repos = workers(store, 6, &RepositoryConfig::default()).await;
    for i in 0..20 {
        repos[0]
            .create(&ClusterDocument::new(
                cluster_key(&format!("c{i:02}")),
                ProvisioningState::Creating,
            ))
            .await
            .unwrap();
    }

    let claims = repos.iter().map(|repo| {
        let repo = repo.clone();
        tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(doc) = repo.dequeue().await.unwrap() {
                assert_eq!(doc.lease_owner.as_deref(), Some(repo.instance_id()));
                claimed.push(doc.key);
            }
            claimed
        })
    });

    let mut owners: HashMap<String, usize> = HashMap::new();
    for claimed in join_all(claims).await {
        for key in claimed.unwrap() {
            *owners.entry(key).or_default() += 1;
        }
    }
    assert_eq!(owners.len(), 20);
    assert!(owners.values().all(|&n| n == 1), "{owners:?}");

    // Every document ends up with exactly the lease its claimer saw.
    for i in 0..20 {
        let doc = repos[0].get(&cluster_key(&format!("c{i:02}"))).await.unwrap();
        assert_eq!(doc.dequeues, 1);
        assert!(doc.lease_owner.is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dequeue_claims_each_document_once_memory() {
    assert_each_document_claimed_once(Arc::new(MemoryStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dequeue_claims_each_document_once_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::from_path(dir.path().join("cirrus.db")).await.unwrap();
    assert_each_document_claimed_once(Arc::new(store)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_patches_do_not_lose_updates() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let repos = workers(store, 2, &RepositoryConfig::default()).await;
    let mut doc = ClusterDocument::new(cluster_key("counter"), ProvisioningState::Succeeded);
    doc.extra.insert("counter".to_string(), json!(0));
    repos[0].create(&doc).await.unwrap();

    let increments = repos.iter().map(|repo| {
        let repo = repo.clone();
        tokio::spawn(async move {
            repo.patch(&cluster_key("counter"), |doc| {
                let n = doc.extra["counter"].as_i64().unwrap_or_default();
                doc.extra.insert("counter".to_string(), json!(n + 1));
                Ok(())
            })
            .await
        })
    });
    for result in join_all(increments).await {
        result.unwrap().unwrap();
    }

    let doc = repos[0].get(&cluster_key("counter")).await.unwrap();
    assert_eq!(doc.extra["counter"], 2);
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed_and_old_owner_locked_out() {
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let config = RepositoryConfig {
        lease_ttl: Duration::from_secs(1),
        ..RepositoryConfig::default()
    };
    let repos = workers(store, 2, &config).await;
    repos[0]
        .create(&ClusterDocument::new(cluster_key("c1"), ProvisioningState::Creating))
        .await
        .unwrap();

    let first = repos[0].dequeue().await.unwrap().unwrap();
    assert!(repos[1].dequeue().await.unwrap().is_none());

    // Epoch-second granularity: wait until `leaseExpires < now` must hold.
    tokio::time::sleep(Duration::from_millis(2100)).await;

    let second = repos[1].dequeue().await.unwrap().unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.lease_owner.as_deref(), Some("worker-1"));
    assert_eq!(second.dequeues, 2);

    assert!(repos[0].lease(&cluster_key("c1")).await.unwrap_err().is_lease_lost());
    assert!(
        repos[0]
            .end_lease(&cluster_key("c1"), ProvisioningState::Succeeded, None)
            .await
            .unwrap_err()
            .is_lease_lost()
    );
    repos[1].lease(&cluster_key("c1")).await.unwrap();
}
