// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock installer for testing.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ClusterInstaller, InstallContext, InstallerError, Workflow};

/// How a [`MockInstaller`] responds to a workflow call.
#[derive(Debug, Clone, Default)]
pub enum MockBehavior {
    /// Return success immediately.
    #[default]
    Succeed,
    /// Return `InstallerError::Failed` with the message.
    Fail(String),
    /// Wait for cancellation, then return `Cancelled`.
    BlockUntilCancelled,
    /// Wait for cancellation, then report success anyway.
    SucceedAfterCancel,
    /// Sleep, then succeed.
    Delay(Duration),
    /// Panic inside the workflow.
    Panic,
}

/// Installer with scripted per-workflow behaviour and call recording.
#[derive(Debug, Default)]
pub struct MockInstaller {
    behaviors: Mutex<HashMap<Workflow, MockBehavior>>,
    calls: Mutex<Vec<(Workflow, String)>>,
}

impl MockInstaller {
    /// A mock that succeeds on every workflow.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the behaviour for one workflow.
    pub fn with(mut self, workflow: Workflow, behavior: MockBehavior) -> Self {
        self.behaviors.get_mut().insert(workflow, behavior);
        self
    }

    /// Change the behaviour of a workflow on a shared mock.
    pub async fn set(&self, workflow: Workflow, behavior: MockBehavior) {
        self.behaviors.lock().await.insert(workflow, behavior);
    }

    /// Calls made so far, as (workflow, cluster key).
    pub async fn calls(&self) -> Vec<(Workflow, String)> {
        self.calls.lock().await.clone()
    }

    /// Number of calls made to `workflow`.
    pub async fn call_count(&self, workflow: Workflow) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(w, _)| *w == workflow)
            .count()
    }

    /// Wait until `workflow` has been called at least once.
    pub async fn wait_for_call(&self, workflow: Workflow, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.call_count(workflow).await > 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn run(&self, workflow: Workflow, ctx: &InstallContext) -> Result<(), InstallerError> {
        self.calls
            .lock()
            .await
            .push((workflow, ctx.key().to_string()));
        let behavior = self
            .behaviors
            .lock()
            .await
            .get(&workflow)
            .cloned()
            .unwrap_or_default();

        match behavior {
            MockBehavior::Succeed => Ok(()),
            MockBehavior::Fail(message) => Err(InstallerError::Failed(message)),
            MockBehavior::BlockUntilCancelled => {
                ctx.cancellation_token().cancelled().await;
                Err(InstallerError::Cancelled)
            }
            MockBehavior::SucceedAfterCancel => {
                ctx.cancellation_token().cancelled().await;
                Ok(())
            }
            MockBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            MockBehavior::Panic => panic!("mock installer panic during {}", workflow.as_str()),
        }
    }
}

#[async_trait]
impl ClusterInstaller for MockInstaller {
    async fn create(&self, ctx: &InstallContext) -> Result<(), InstallerError> {
        self.run(Workflow::Create, ctx).await
    }

    async fn update(&self, ctx: &InstallContext) -> Result<(), InstallerError> {
        self.run(Workflow::Update, ctx).await
    }

    async fn delete(&self, ctx: &InstallContext) -> Result<(), InstallerError> {
        self.run(Workflow::Delete, ctx).await
    }

    fn installer_type(&self) -> &'static str {
        "mock"
    }
}
