// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for cirrus-backend.
//!
//! [`BackendRuntime`] runs the worker pool inside an existing tokio
//! application instead of the standalone binary.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cirrus_backend::installer::CommandInstaller;
//! use cirrus_backend::runtime::BackendRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = cirrus_store::connect("sqlite:/var/lib/cirrus/cirrus.db").await?;
//!
//!     let runtime = BackendRuntime::builder()
//!         .store(store)
//!         .installer(Arc::new(CommandInstaller::new("/usr/local/bin/installer")))
//!         .instance_id("worker-1")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... create cluster documents through runtime.clusters() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use cirrus_store::{DocumentStore, RetryPolicy};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::database::{AsyncOperations, ClusterRepository, RepositoryConfig};
use crate::error::{Error, Result};
use crate::installer::ClusterInstaller;
use crate::worker_pool::{WorkerPool, WorkerPoolConfig};

/// Builder for creating a [`BackendRuntime`].
pub struct BackendRuntimeBuilder {
    store: Option<Arc<dyn DocumentStore>>,
    installer: Option<Arc<dyn ClusterInstaller>>,
    instance_id: Option<String>,
    pool: WorkerPoolConfig,
    repository: RepositoryConfig,
    drain_timeout: Duration,
}

impl Default for BackendRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            installer: None,
            instance_id: None,
            pool: WorkerPoolConfig::default(),
            repository: RepositoryConfig::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl BackendRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the document store (required).
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the cluster installer (required).
    pub fn installer(mut self, installer: Arc<dyn ClusterInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Set the identity written to `leaseOwner`.
    ///
    /// Default: a random UUID
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Set the worker pool configuration.
    pub fn worker_pool_config(mut self, config: WorkerPoolConfig) -> Self {
        self.pool = config;
        self
    }

    /// Set the repository configuration.
    pub fn repository_config(mut self, config: RepositoryConfig) -> Self {
        self.repository = config;
        self
    }

    /// Set the maximum number of concurrent tasks.
    ///
    /// Default: 100
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.pool.max_workers = max_workers;
        self
    }

    /// Set the lease duration.
    ///
    /// Default: 60 seconds
    pub fn lease_ttl(mut self, ttl: Duration) -> Self {
        self.repository.lease_ttl = ttl;
        self
    }

    /// Set the read-modify-write retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.repository.retry = policy;
        self
    }

    /// Set how long shutdown waits for running tasks.
    ///
    /// Default: 30 seconds
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or the heartbeat does
    /// not fit inside the lease.
    pub fn build(self) -> Result<BackendRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| Error::Other("store is required".to_string()))?;
        let installer = self
            .installer
            .ok_or_else(|| Error::Other("installer is required".to_string()))?;
        if self.pool.max_workers == 0 {
            return Err(Error::Other("max_workers must be positive".to_string()));
        }
        if self.pool.heartbeat_interval * 2 >= self.repository.lease_ttl {
            return Err(Error::Other(format!(
                "heartbeat interval {:?} must be less than half of the lease TTL {:?}",
                self.pool.heartbeat_interval, self.repository.lease_ttl
            )));
        }

        Ok(BackendRuntimeConfig {
            store,
            installer,
            instance_id: self
                .instance_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            pool: self.pool,
            repository: self.repository,
            drain_timeout: self.drain_timeout,
        })
    }
}

/// Configuration for a [`BackendRuntime`].
pub struct BackendRuntimeConfig {
    store: Arc<dyn DocumentStore>,
    installer: Arc<dyn ClusterInstaller>,
    instance_id: String,
    pool: WorkerPoolConfig,
    repository: RepositoryConfig,
    drain_timeout: Duration,
}

impl BackendRuntimeConfig {
    /// Register the lease trigger and start polling for work.
    pub async fn start(self) -> Result<BackendRuntime> {
        let clusters =
            ClusterRepository::new(self.store.clone(), &self.instance_id, &self.repository).await?;
        let async_operations = AsyncOperations::new(self.store.clone(), &self.repository);

        let pool = WorkerPool::new(
            clusters.clone(),
            Arc::new(async_operations.clone()),
            self.installer.clone(),
            self.pool,
        );

        let shutdown = CancellationToken::new();
        let pool_handle = tokio::spawn({
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            async move { pool.run(shutdown).await }
        });

        info!(
            instance_id = %self.instance_id,
            driver = self.store.driver(),
            installer = self.installer.installer_type(),
            max_workers = pool.config().max_workers,
            "BackendRuntime started"
        );

        Ok(BackendRuntime {
            pool,
            clusters,
            async_operations,
            shutdown,
            pool_handle,
            drain_timeout: self.drain_timeout,
        })
    }
}

/// A running worker pool that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct BackendRuntime {
    pool: WorkerPool,
    clusters: ClusterRepository,
    async_operations: AsyncOperations,
    shutdown: CancellationToken,
    pool_handle: JoinHandle<()>,
    drain_timeout: Duration,
}

impl BackendRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> BackendRuntimeBuilder {
        BackendRuntimeBuilder::new()
    }

    /// Identity written into `leaseOwner`.
    pub fn instance_id(&self) -> &str {
        self.clusters.instance_id()
    }

    /// The running pool.
    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Repository the pool works on.
    pub fn clusters(&self) -> &ClusterRepository {
        &self.clusters
    }

    /// Async operation records updated by the pool.
    pub fn async_operations(&self) -> &AsyncOperations {
        &self.async_operations
    }

    /// Check if the poller is still running.
    pub fn is_running(&self) -> bool {
        !self.pool_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops polling, then waits up to the drain timeout for running tasks.
    /// Leases of tasks still running afterwards expire on their own.
    pub async fn shutdown(self) -> Result<()> {
        info!("BackendRuntime shutting down...");

        self.shutdown.cancel();
        if let Err(e) = self.pool_handle.await {
            error!("Worker pool task panicked: {}", e);
        }

        match tokio::time::timeout(self.drain_timeout, self.pool.wait_idle()).await {
            Ok(()) => info!("BackendRuntime shutdown complete"),
            Err(_) => warn!(
                active_workers = self.pool.active_workers(),
                drain_timeout_secs = self.drain_timeout.as_secs(),
                "Tasks still running at shutdown, their leases will expire"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::MockInstaller;
    use cirrus_store::MemoryStore;

    #[test]
    fn test_build_requires_store_and_installer() {
        let err = BackendRuntime::builder().build().err().unwrap();
        assert!(err.to_string().contains("store is required"));

        let err = BackendRuntime::builder()
            .store(Arc::new(MemoryStore::new()))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("installer is required"));
    }

    #[test]
    fn test_build_rejects_heartbeat_longer_than_half_lease() {
        let err = BackendRuntime::builder()
            .store(Arc::new(MemoryStore::new()))
            .installer(Arc::new(MockInstaller::new()))
            .lease_ttl(Duration::from_secs(20))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("heartbeat interval"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let runtime = BackendRuntime::builder()
            .store(Arc::new(MemoryStore::new()))
            .installer(Arc::new(MockInstaller::new()))
            .instance_id("worker-1")
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert_eq!(runtime.instance_id(), "worker-1");
        assert!(runtime.is_running());
        assert_eq!(runtime.worker_pool().active_workers(), 0);
        runtime.shutdown().await.unwrap();
    }
}
