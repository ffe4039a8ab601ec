// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Repositories over the document store.

use std::time::Duration;

use cirrus_store::RetryPolicy;
use cirrus_store::collection::DEFAULT_REQUEST_TIMEOUT;

pub mod async_operations;
pub mod clusters;

pub use async_operations::{AsyncOperationMutator, AsyncOperationTracker, AsyncOperations};
pub use clusters::{ClusterMutator, ClusterRepository};

/// Settings shared by the repositories.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Lease duration the `renewLease` trigger stamps.
    pub lease_ttl: Duration,
    /// Deadline for each store call.
    pub request_timeout: Duration,
    /// Read-modify-write retry policy.
    pub retry: RetryPolicy,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(60),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}
