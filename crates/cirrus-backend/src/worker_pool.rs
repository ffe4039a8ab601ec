// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend worker pool.
//!
//! The pool polls for work and runs each claimed document as its own task:
//!
//! ```text
//! run ──► try_dequeue ──► spawn supervisor ──► spawn task body
//!                                               │
//!                                               ├─ heartbeat (renew, watch for delete)
//!                                               ├─ manager.run(workflow)
//!                                               ├─ heartbeat.stop()
//!                                               └─ end lease / delete document
//! ```
//!
//! The supervisor contains panics in the task body. The worker slot is
//! released by a drop guard and the heartbeat stops when dropped, so a
//! panicked task's lease simply expires and another worker reclaims it.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use cirrus_store::StoreError;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{CloudErrorBody, Cluster, ClusterDocument, ProvisioningState};
use crate::database::{AsyncOperationTracker, ClusterRepository};
use crate::error::{Error, Result};
use crate::heartbeat::Heartbeat;
use crate::installer::{ClusterInstaller, InstallContext, Workflow};
use crate::manager::Manager;
use crate::wait::poll_until;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum number of concurrently running tasks.
    pub max_workers: usize,
    /// A document dequeued more often than this is failed without running its workflow.
    pub max_dequeue_count: u32,
    /// Sleep between dequeue attempts when there is no work.
    pub poll_interval: Duration,
    /// Lease renewal interval.
    pub heartbeat_interval: Duration,
    /// Deadline for one installer workflow.
    pub operation_timeout: Duration,
    /// How often the delete hand-off re-reads the document.
    pub delete_poll_interval: Duration,
    /// How long the delete hand-off waits for the cancelled task to end.
    pub delete_poll_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 100,
            max_dequeue_count: 5,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(6 * 60 * 60),
            delete_poll_interval: Duration::from_millis(500),
            delete_poll_timeout: Duration::from_secs(60),
        }
    }
}

/// A pool of lifecycle tasks for one worker instance. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

struct Inner {
    clusters: ClusterRepository,
    async_operations: Arc<dyn AsyncOperationTracker>,
    manager: Manager,
    config: WorkerPoolConfig,
    workers: AtomicUsize,
    worker_done: Notify,
}

/// Holds one worker slot; releasing it wakes anyone waiting for capacity.
struct WorkerSlot {
    inner: Arc<Inner>,
}

impl WorkerSlot {
    fn acquire(inner: &Arc<Inner>) -> Self {
        inner.workers.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: inner.clone(),
        }
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.inner.workers.fetch_sub(1, Ordering::SeqCst);
        self.inner.worker_done.notify_waiters();
    }
}

impl WorkerPool {
    /// Build a pool. Nothing runs until [`run`](Self::run) or
    /// [`try_dequeue`](Self::try_dequeue) is called.
    pub fn new(
        clusters: ClusterRepository,
        async_operations: Arc<dyn AsyncOperationTracker>,
        installer: Arc<dyn ClusterInstaller>,
        config: WorkerPoolConfig,
    ) -> Self {
        let manager = Manager::new(installer, config.operation_timeout);
        Self {
            inner: Arc::new(Inner {
                clusters,
                async_operations,
                manager,
                config,
                workers: AtomicUsize::new(0),
                worker_done: Notify::new(),
            }),
        }
    }

    /// Number of tasks currently running.
    pub fn active_workers(&self) -> usize {
        self.inner.workers.load(Ordering::SeqCst)
    }

    /// Pool settings.
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    /// Poll for work until `shutdown` is cancelled.
    ///
    /// Running tasks are not waited for; see [`wait_idle`](Self::wait_idle).
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            instance_id = %self.inner.clusters.instance_id(),
            max_workers = self.inner.config.max_workers,
            "Worker pool started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.wait_for_capacity() => {}
            }

            let did_work = match self.try_dequeue().await {
                Ok(did_work) => did_work,
                Err(e) => {
                    error!(error = %e, "Dequeue failed");
                    false
                }
            };

            if !did_work {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.inner.config.poll_interval) => {}
                }
            }
        }

        info!(
            active_workers = self.active_workers(),
            "Worker pool stopped polling"
        );
    }

    /// Attempt one dequeue. Returns whether a document was claimed.
    ///
    /// A claimed document is handled on a new task; this call does not wait
    /// for it. A document over the dequeue cap is failed right here.
    pub async fn try_dequeue(&self) -> Result<bool> {
        let Some(doc) = self.inner.clusters.dequeue().await? else {
            return Ok(false);
        };

        if doc.dequeues > self.inner.config.max_dequeue_count {
            error!(
                resource = %doc.key,
                dequeues = doc.dequeues,
                max_dequeue_count = self.inner.config.max_dequeue_count,
                "Dequeued too many times, failing"
            );
            let prior = doc.state().clone();
            self.inner
                .end_lease(&doc, ProvisioningState::Failed, Some(prior))
                .await?;
            return Ok(true);
        }

        info!(
            resource = %doc.key,
            state = %doc.state(),
            dequeues = doc.dequeues,
            "Dequeued"
        );

        let slot = WorkerSlot::acquire(&self.inner);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _slot = slot;
            let key = doc.key.clone();
            let started = Instant::now();

            let body = tokio::spawn(inner.clone().handle(doc));
            match body.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(resource = %key, error = %e, code = e.error_code(), "Task failed")
                }
                Err(e) if e.is_panic() => {
                    error!(
                        resource = %key,
                        "Task panicked, lease left to expire: {}",
                        panic_message(e.into_panic())
                    )
                }
                Err(e) => error!(resource = %key, "Task aborted: {}", e),
            }

            info!(
                resource = %key,
                duration_ms = started.elapsed().as_millis() as u64,
                "Done"
            );
        });

        Ok(true)
    }

    /// Wait until fewer than `max_workers` tasks are running.
    pub async fn wait_for_capacity(&self) {
        let max = self.inner.config.max_workers;
        self.wait_until(|active| active < max).await;
    }

    /// Wait until no task is running.
    pub async fn wait_idle(&self) {
        self.wait_until(|active| active == 0).await;
    }

    async fn wait_until(&self, ready: impl Fn(usize) -> bool) {
        loop {
            let notified = self.inner.worker_done.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();
            if ready(self.active_workers()) {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("instance_id", &self.inner.clusters.instance_id())
            .field("active_workers", &self.active_workers())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Inner {
    /// Task body for one claimed document.
    async fn handle(self: Arc<Self>, doc: ClusterDocument) -> Result<()> {
        let cancel = CancellationToken::new();
        let mut heartbeat = Heartbeat::start(
            self.clusters.clone(),
            &doc,
            self.config.heartbeat_interval,
            cancel.clone(),
            {
                let inner = self.clone();
                move |current| {
                    tokio::spawn(inner.handle_delete(current));
                }
            },
        );

        let prior = doc.state().clone();
        let ctx = InstallContext::new(cancel, doc.clone(), self.clusters.clone());
        let outcome = match Manager::workflow_for(&prior) {
            Ok(workflow) => self.manager.run(workflow, &ctx).await.map(|()| workflow),
            Err(e) => Err(e),
        };

        heartbeat.stop().await;
        if heartbeat.lease_lost() {
            warn!(resource = %doc.key, "Lost lease, abandoning task");
            return Ok(());
        }

        match outcome {
            Ok(Workflow::Delete) => self.finish_delete(&doc).await,
            Ok(workflow) => {
                info!(resource = %doc.key, workflow = workflow.as_str(), "Workflow succeeded");
                self.end_lease(&doc, ProvisioningState::Succeeded, None).await
            }
            Err(e) => {
                error!(
                    resource = %doc.key,
                    state = %prior,
                    error = %e,
                    code = e.error_code(),
                    "Workflow failed"
                );
                self.end_lease(&doc, ProvisioningState::Failed, Some(prior))
                    .await
            }
        }
    }

    /// Mark the delete's async operation done, then remove the document.
    ///
    /// Ownership is confirmed with a lease renewal first, so a task that lost
    /// its lease between heartbeats does not touch the operation.
    async fn finish_delete(&self, doc: &ClusterDocument) -> Result<()> {
        self.clusters.lease(&doc.key).await?;

        if let Err(e) = self
            .update_async_operation(
                doc.async_operation_id.as_deref(),
                None,
                ProvisioningState::Succeeded,
                None,
            )
            .await
        {
            error!(resource = %doc.key, error = %e, "Failed to finalise delete operation");
            return self
                .end_lease(doc, ProvisioningState::Failed, Some(ProvisioningState::Deleting))
                .await;
        }

        match self.clusters.delete(doc).await {
            Ok(()) | Err(Error::Store(StoreError::NotFound)) => {
                info!(resource = %doc.key, "Cluster deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Release the lease with a final state, then update the async operation.
    ///
    /// The lease-guarded write goes first: on `LeaseLost` the operation
    /// belongs to the new owner and is left alone. The cluster document is
    /// authoritative, so an async operation update failure is only logged.
    async fn end_lease(
        &self,
        doc: &ClusterDocument,
        state: ProvisioningState,
        failed_state: Option<ProvisioningState>,
    ) -> Result<()> {
        if let Err(e) = self
            .clusters
            .end_lease(&doc.key, state.clone(), failed_state.clone())
            .await
        {
            if e.is_lease_lost() {
                warn!(resource = %doc.key, "Lease taken over before it was ended, leaving async operation");
            }
            return Err(e);
        }
        info!(resource = %doc.key, state = %state, "Lease ended");

        if let Err(e) = self
            .update_async_operation(
                doc.async_operation_id.as_deref(),
                Some(&doc.cluster),
                state,
                failed_state,
            )
            .await
        {
            warn!(resource = %doc.key, error = %e, "Failed to update async operation");
        }
        Ok(())
    }

    /// Record `state` on the async operation `id`, if there is one.
    ///
    /// Terminal states also set the end time, a snapshot of the cluster and,
    /// on failure, the generic error body.
    async fn update_async_operation(
        &self,
        id: Option<&str>,
        cluster: Option<&Cluster>,
        state: ProvisioningState,
        failed_state: Option<ProvisioningState>,
    ) -> Result<()> {
        let Some(id) = id else {
            return Ok(());
        };

        let snapshot = cluster.map(|cluster| {
            let mut cluster = cluster.clone();
            cluster.properties.provisioning_state = state.clone();
            cluster.properties.failed_provisioning_state = failed_state;
            cluster
        });

        self.async_operations
            .patch(id, &|op| {
                op.async_operation.provisioning_state = state.clone();
                if state.is_terminal() {
                    op.async_operation.end_time = Some(Utc::now());
                }
                if state == ProvisioningState::Failed {
                    op.async_operation.error = Some(CloudErrorBody::internal_server_error());
                }
                if let Some(snapshot) = &snapshot {
                    op.cluster = Some(snapshot.clone());
                }
                Ok(())
            })
            .await?;
        debug!(async_operation_id = %id, state = %state, "Async operation updated");
        Ok(())
    }

    /// Resume a delete that interrupted an in-flight task.
    ///
    /// The cancelled task ends its lease with `Failed` and clears
    /// `asyncOperationID`. Once that is visible, the document is put back into
    /// `Deleting` with the delete's operation id so the next dequeue picks
    /// the delete up. If the task does not end in time, the delete's
    /// operation is failed so pollers are not left waiting.
    async fn handle_delete(self: Arc<Self>, requested: ClusterDocument) {
        let key = requested.key.clone();
        let delete_operation = requested.async_operation_id.clone();
        info!(resource = %key, "Handing off delete request");

        if let Err(e) = self
            .update_async_operation(
                delete_operation.as_deref(),
                None,
                ProvisioningState::Deleting,
                None,
            )
            .await
        {
            warn!(resource = %key, error = %e, "Failed to update delete operation");
        }

        let clusters = &self.clusters;
        let key_ref = key.as_str();
        if let Err(e) = poll_until(
            "cancelled task to end its lease",
            self.config.delete_poll_interval,
            self.config.delete_poll_timeout,
            move || async move {
                let current = clusters.get(key_ref).await?;
                Ok::<_, Error>(
                    current.state() == &ProvisioningState::Failed && current.lease_owner.is_none(),
                )
            },
        )
        .await
        {
            error!(resource = %key, error = %e, "Delete hand-off gave up");
            if let Err(e) = self
                .update_async_operation(
                    delete_operation.as_deref(),
                    None,
                    ProvisioningState::Failed,
                    None,
                )
                .await
            {
                warn!(resource = %key, error = %e, "Failed to fail delete operation");
            }
            return;
        }

        let resumed = self
            .clusters
            .patch(&key, |doc| {
                if doc.state() == &ProvisioningState::Failed && doc.lease_owner.is_none() {
                    doc.set_state(ProvisioningState::Deleting);
                    doc.async_operation_id = delete_operation.clone();
                }
                Ok(())
            })
            .await;

        match resumed {
            Ok(doc) if doc.state() == &ProvisioningState::Deleting => {
                info!(resource = %key, "Delete request requeued")
            }
            Ok(doc) => warn!(
                resource = %key,
                state = %doc.state(),
                "Document changed during delete hand-off, leaving it"
            ),
            Err(e) => error!(resource = %key, error = %e, "Failed to requeue delete request"),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
