// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster installer abstraction.
//!
//! The installer does the actual cloud and in-cluster work. The lifecycle
//! engine only cares whether a workflow succeeded; error details are logged
//! and the document ends `Failed`.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::api::ClusterDocument;
use crate::database::ClusterRepository;

pub mod command;
pub mod mock;

pub use command::CommandInstaller;
pub use mock::{MockBehavior, MockInstaller};

/// Errors reported by installers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InstallerError {
    /// The workflow observed cancellation and stopped.
    #[error("Installation cancelled")]
    Cancelled,

    /// The workflow did not finish within its deadline.
    #[error("Installation timed out after {0:?}")]
    Timeout(Duration),

    /// The installer process exited with a non-zero code.
    #[error("Exit code {exit_code}: {stderr}")]
    ExitCode {
        /// Exit code from the process.
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Any other installer failure.
    #[error("{0}")]
    Failed(String),
}

/// Workflow selected by a document's provisioning state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Workflow {
    /// Provision a new cluster.
    Create,
    /// Reconcile an existing cluster.
    Update,
    /// Tear a cluster down.
    Delete,
}

impl Workflow {
    /// Lowercase name, also passed to external installers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Workflow::Create => "create",
            Workflow::Update => "update",
            Workflow::Delete => "delete",
        }
    }
}

/// What an installer workflow gets to work with.
///
/// The document is the copy claimed at dequeue time. Progress can be
/// persisted with [`patch`](Self::patch), which only lands while this worker
/// still holds the lease.
#[derive(Debug, Clone)]
pub struct InstallContext {
    cancel: CancellationToken,
    doc: ClusterDocument,
    clusters: ClusterRepository,
}

impl InstallContext {
    /// Context for one workflow run on `doc`.
    pub fn new(cancel: CancellationToken, doc: ClusterDocument, clusters: ClusterRepository) -> Self {
        Self {
            cancel,
            doc,
            clusters,
        }
    }

    /// Cancelled when the task must stop: an external delete request or a
    /// lost lease.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True once the task has been asked to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The document as dequeued.
    pub fn document(&self) -> &ClusterDocument {
        &self.doc
    }

    /// Resource key of the document.
    pub fn key(&self) -> &str {
        &self.doc.key
    }

    /// Lease-guarded read-modify-write of the cluster document.
    pub async fn patch<F>(&self, mutator: F) -> crate::Result<ClusterDocument>
    where
        F: Fn(&mut ClusterDocument) -> crate::Result<()> + Send + Sync,
    {
        self.clusters.patch_with_lease(&self.doc.key, mutator).await
    }
}

/// Trait for cluster installers.
///
/// Each call is long-running and must return promptly once the context's
/// token is cancelled.
#[async_trait]
pub trait ClusterInstaller: Send + Sync {
    /// Install a new cluster.
    async fn create(&self, ctx: &InstallContext) -> Result<(), InstallerError>;

    /// Reconcile an existing cluster with its document.
    async fn update(&self, ctx: &InstallContext) -> Result<(), InstallerError>;

    /// Tear a cluster down.
    async fn delete(&self, ctx: &InstallContext) -> Result<(), InstallerError>;

    /// Installer type name for logging.
    fn installer_type(&self) -> &'static str {
        "custom"
    }
}
