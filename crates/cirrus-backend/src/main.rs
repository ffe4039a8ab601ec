// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cirrus Backend - Cluster Lifecycle Worker
//!
//! Polls the cluster store for work and runs the configured installer for
//! each claimed cluster until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use cirrus_backend::config::Config;
use cirrus_backend::installer::CommandInstaller;
use cirrus_backend::runtime::BackendRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cirrus_backend=info,cirrus_store=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        instance_id = %config.instance_id,
        max_workers = config.max_workers,
        max_dequeue_count = config.max_dequeue_count,
        lease_ttl_secs = config.lease_ttl.as_secs(),
        "Starting Cirrus Backend"
    );

    let command = config
        .installer_command
        .as_deref()
        .context("CIRRUS_INSTALLER_COMMAND must be set")?;
    let installer = CommandInstaller::from_command_line(command)
        .context("CIRRUS_INSTALLER_COMMAND is empty")?;

    let store = cirrus_store::connect(&config.database_url).await?;
    info!(driver = store.driver(), "Connected to document store");

    let runtime = BackendRuntime::builder()
        .store(store)
        .installer(Arc::new(installer))
        .instance_id(&config.instance_id)
        .worker_pool_config(config.worker_pool_config())
        .repository_config(config.repository_config())
        .build()?
        .start()
        .await?;

    info!("Cirrus Backend ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Cirrus Backend shut down");

    Ok(())
}
