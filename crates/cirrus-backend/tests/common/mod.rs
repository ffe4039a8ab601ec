// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test utilities for cirrus-backend integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cirrus_backend::api::{AsyncOperationDocument, ClusterDocument, ProvisioningState};
use cirrus_backend::database::{AsyncOperations, ClusterRepository, RepositoryConfig};
use cirrus_backend::installer::MockInstaller;
use cirrus_backend::{WorkerPool, WorkerPoolConfig};
use cirrus_store::{DocumentStore, MemoryStore};

pub const SUBSCRIPTION: &str = "3f2c6a8e-1b7d-4c55-9e0a-6d1f2b3c4d5e";

/// Canonical key for a cluster named `name` in the test subscription.
pub fn cluster_key(name: &str) -> String {
    format!(
        "/subscriptions/{SUBSCRIPTION}/resourcegroups/rg/providers/microsoft.redhatopenshift/openshiftclusters/{name}"
    )
}

/// Intervals short enough for tests to observe several ticks.
pub fn fast_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        max_workers: 4,
        max_dequeue_count: 3,
        poll_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(50),
        operation_timeout: Duration::from_secs(10),
        delete_poll_interval: Duration::from_millis(20),
        delete_poll_timeout: Duration::from_secs(5),
    }
}

/// A worker instance over a shared memory store.
pub struct TestEnv {
    pub store: Arc<dyn DocumentStore>,
    pub clusters: ClusterRepository,
    pub async_operations: AsyncOperations,
    pub installer: Arc<MockInstaller>,
    pub pool: WorkerPool,
}

impl TestEnv {
    pub async fn new(installer: MockInstaller) -> Self {
        Self::with_config(installer, fast_config()).await
    }

    pub async fn with_config(installer: MockInstaller, config: WorkerPoolConfig) -> Self {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        Self::on_store(store, "worker-1", installer, config).await
    }

    pub async fn on_store(
        store: Arc<dyn DocumentStore>,
        instance_id: &str,
        installer: MockInstaller,
        config: WorkerPoolConfig,
    ) -> Self {
        let repository = RepositoryConfig::default();
        let clusters = ClusterRepository::new(store.clone(), instance_id, &repository)
            .await
            .unwrap();
        let async_operations = AsyncOperations::new(store.clone(), &repository);
        let installer = Arc::new(installer);
        let pool = WorkerPool::new(
            clusters.clone(),
            Arc::new(async_operations.clone()),
            installer.clone(),
            config,
        );
        Self {
            store,
            clusters,
            async_operations,
            installer,
            pool,
        }
    }

    /// Store a cluster in `state` with a fresh async operation attached.
    pub async fn seed(&self, name: &str, state: ProvisioningState) -> (ClusterDocument, String) {
        let op = self
            .async_operations
            .create(&AsyncOperationDocument::new(state.clone()))
            .await
            .unwrap();
        let mut doc = ClusterDocument::new(cluster_key(name), state);
        doc.async_operation_id = Some(op.id.clone());
        (self.clusters.create(&doc).await.unwrap(), op.id)
    }

    /// Poll the document until `done` holds for it.
    pub async fn wait_for_cluster<F>(&self, name: &str, done: F) -> ClusterDocument
    where
        F: Fn(&ClusterDocument) -> bool,
    {
        let key = cluster_key(name);
        for _ in 0..500 {
            if let Ok(doc) = self.clusters.get(&key).await
                && done(&doc)
            {
                return doc;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cluster {name} never reached the expected state");
    }

    /// Poll until the document is gone.
    pub async fn wait_for_removal(&self, name: &str) {
        let key = cluster_key(name);
        for _ in 0..500 {
            match self.clusters.get(&key).await {
                Err(e) if e.is_not_found() => return,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        panic!("cluster {name} was never removed");
    }

    /// Wait for every running task to finish.
    pub async fn wait_idle(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.pool.wait_idle())
            .await
            .expect("tasks did not finish");
    }
}
