// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle state machine.
//!
//! | State | Workflow | On success | On error |
//! |-------|----------|------------|----------|
//! | Creating | create | Succeeded | Failed |
//! | Updating | update | Succeeded | Failed |
//! | Deleting | delete | document removed | Failed |
//! | anything else | none | - | Failed |
//!
//! Applying the outcome is the worker pool's job; the manager only selects
//! and runs the workflow.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::api::ProvisioningState;
use crate::error::{Error, Result};
use crate::installer::{ClusterInstaller, InstallContext, InstallerError, Workflow};

/// Runs installer workflows for dequeued documents.
#[derive(Clone)]
pub struct Manager {
    installer: Arc<dyn ClusterInstaller>,
    operation_timeout: Duration,
}

impl Manager {
    /// Run workflows on `installer`, each bounded by `operation_timeout`.
    pub fn new(installer: Arc<dyn ClusterInstaller>, operation_timeout: Duration) -> Self {
        Self {
            installer,
            operation_timeout,
        }
    }

    /// Workflow for a document in `state`.
    ///
    /// Terminal and unknown states have none; a document dequeued in one of
    /// them breaks the dequeue filter's contract.
    pub fn workflow_for(state: &ProvisioningState) -> Result<Workflow> {
        match state {
            ProvisioningState::Creating => Ok(Workflow::Create),
            ProvisioningState::Updating => Ok(Workflow::Update),
            ProvisioningState::Deleting => Ok(Workflow::Delete),
            other => Err(Error::UnexpectedProvisioningState(other.clone())),
        }
    }

    /// Run `workflow` to completion.
    ///
    /// The installer is expected to observe the context's token. A workflow
    /// that reports success after the token was cancelled still fails, so an
    /// interrupting delete always wins. A workflow exceeding the operation
    /// timeout is dropped.
    pub async fn run(&self, workflow: Workflow, ctx: &InstallContext) -> Result<()> {
        info!(
            resource = %ctx.key(),
            workflow = workflow.as_str(),
            installer = self.installer.installer_type(),
            "Running workflow"
        );

        let call = async {
            match workflow {
                Workflow::Create => self.installer.create(ctx).await,
                Workflow::Update => self.installer.update(ctx).await,
                Workflow::Delete => self.installer.delete(ctx).await,
            }
        };

        match tokio::time::timeout(self.operation_timeout, call).await {
            Ok(Ok(())) if ctx.is_cancelled() => {
                warn!(
                    resource = %ctx.key(),
                    workflow = workflow.as_str(),
                    "Workflow finished after cancellation, treating as cancelled"
                );
                Err(InstallerError::Cancelled.into())
            }
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(InstallerError::Timeout(self.operation_timeout).into()),
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("installer", &self.installer.installer_type())
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}
