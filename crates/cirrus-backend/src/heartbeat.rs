// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-task lease heartbeat.
//!
//! While a task runs, the heartbeat re-reads the document and renews the
//! lease on every tick. It cancels the task when:
//!
//! - the document is externally moved to `Deleting`, after handing the
//!   document to the delete path exactly once;
//! - the read or the renewal fails. `LeaseLost` and a vanished document also
//!   set the lease-lost flag, so the task knows not to end the lease.
//!
//! [`Heartbeat::stop`] waits for an in-flight renewal to finish, so no
//! renewal can land after the task ends the lease. Dropping the heartbeat
//! only signals it to stop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::api::{ClusterDocument, ProvisioningState};
use crate::database::ClusterRepository;

pub(crate) struct Heartbeat {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
    lease_lost: Arc<AtomicBool>,
}

impl Heartbeat {
    /// Start renewing the lease on `doc`, cancelling `cancel` on trouble.
    ///
    /// `on_delete` receives the freshly read document if an external delete
    /// request is observed while the task runs a non-delete workflow.
    pub(crate) fn start<D>(
        clusters: ClusterRepository,
        doc: &ClusterDocument,
        interval: Duration,
        cancel: CancellationToken,
        on_delete: D,
    ) -> Self
    where
        D: FnOnce(ClusterDocument) + Send + 'static,
    {
        let stop = CancellationToken::new();
        let lease_lost = Arc::new(AtomicBool::new(false));
        let key = doc.key.clone();
        let watch_for_delete = doc.state() != &ProvisioningState::Deleting;

        let handle = tokio::spawn({
            let stop = stop.clone();
            let lease_lost = lease_lost.clone();
            async move {
                let mut on_delete = watch_for_delete.then_some(on_delete);
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    let current = match clusters.get(&key).await {
                        Ok(current) => current,
                        Err(e) => {
                            error!(resource = %key, error = %e, "Heartbeat failed to read document, cancelling task");
                            if e.is_not_found() {
                                lease_lost.store(true, Ordering::SeqCst);
                            }
                            cancel.cancel();
                            break;
                        }
                    };

                    if current.state() == &ProvisioningState::Deleting
                        && let Some(hand_off) = on_delete.take()
                    {
                        warn!(resource = %key, "Delete requested during in-flight work, cancelling task");
                        cancel.cancel();
                        hand_off(current);
                    }

                    match clusters.lease(&key).await {
                        Ok(_) => debug!(resource = %key, "Lease renewed"),
                        Err(e) => {
                            error!(resource = %key, error = %e, "Failed to renew lease, cancelling task");
                            if e.is_lease_lost() || e.is_not_found() {
                                lease_lost.store(true, Ordering::SeqCst);
                            }
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        });

        Self {
            stop,
            handle: Some(handle),
            lease_lost,
        }
    }

    /// Stop renewing and wait for the heartbeat task to exit. Idempotent.
    pub(crate) async fn stop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            error!("Heartbeat task panicked: {}", e);
        }
    }

    /// True once the heartbeat has seen the lease taken over or the document gone.
    pub(crate) fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
