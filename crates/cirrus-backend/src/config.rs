// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for cirrus-backend.

use std::str::FromStr;
use std::time::Duration;

use cirrus_store::RetryPolicy;

use crate::database::RepositoryConfig;
use crate::worker_pool::WorkerPoolConfig;

/// Backend configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Store URL: `memory:`, `sqlite:<path>` or `postgres://...`
    pub database_url: String,
    /// Identity written to `leaseOwner` by this process
    pub instance_id: String,
    /// Concurrent lifecycle tasks per process
    pub max_workers: usize,
    /// Dequeues after which a document is failed without running its workflow
    pub max_dequeue_count: u32,
    /// Sleep between dequeue attempts when the queue is empty
    pub poll_interval: Duration,
    /// Lease renewal tick
    pub heartbeat_interval: Duration,
    /// Lease duration stamped by the store on every lease write
    pub lease_ttl: Duration,
    /// Deadline for a single store call
    pub request_timeout: Duration,
    /// Deadline for one installer workflow
    pub operation_timeout: Duration,
    /// External installer executable and leading arguments
    pub installer_command: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CIRRUS_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("CIRRUS_DATABASE_URL"))?;

        let instance_id = std::env::var("CIRRUS_INSTANCE_ID")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let installer_command = std::env::var("CIRRUS_INSTALLER_COMMAND")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let config = Self {
            database_url,
            instance_id,
            max_workers: positive("CIRRUS_MAX_WORKERS", 100)?,
            max_dequeue_count: positive("CIRRUS_MAX_DEQUEUE_COUNT", 5)?,
            poll_interval: Duration::from_millis(positive("CIRRUS_POLL_INTERVAL_MS", 1000)?),
            heartbeat_interval: Duration::from_secs(positive(
                "CIRRUS_HEARTBEAT_INTERVAL_SECS",
                10,
            )?),
            lease_ttl: Duration::from_secs(positive("CIRRUS_LEASE_TTL_SECS", 60)?),
            request_timeout: Duration::from_secs(positive("CIRRUS_REQUEST_TIMEOUT_SECS", 30)?),
            operation_timeout: Duration::from_secs(positive(
                "CIRRUS_OPERATION_TIMEOUT_SECS",
                6 * 60 * 60,
            )?),
            installer_command,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// The heartbeat must renew well inside the lease TTL, so the interval has
    /// to be strictly less than half of it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval * 2 >= self.lease_ttl {
            return Err(ConfigError::Invalid {
                var: "CIRRUS_HEARTBEAT_INTERVAL_SECS",
                value: self.heartbeat_interval.as_secs().to_string(),
                reason: format!(
                    "must be less than half of the lease TTL ({}s)",
                    self.lease_ttl.as_secs()
                ),
            });
        }
        Ok(())
    }

    /// Worker pool settings derived from this configuration.
    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            max_workers: self.max_workers,
            max_dequeue_count: self.max_dequeue_count,
            poll_interval: self.poll_interval,
            heartbeat_interval: self.heartbeat_interval,
            operation_timeout: self.operation_timeout,
            ..WorkerPoolConfig::default()
        }
    }

    /// Repository settings derived from this configuration.
    pub fn repository_config(&self) -> RepositoryConfig {
        RepositoryConfig {
            lease_ttl: self.lease_ttl,
            request_timeout: self.request_timeout,
            retry: RetryPolicy::default(),
        }
    }
}

fn positive<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let Ok(raw) = std::env::var(var) else {
        return Ok(default);
    };
    let invalid = |reason: &str| ConfigError::Invalid {
        var,
        value: raw.clone(),
        reason: reason.to_string(),
    };
    let value: T = raw.trim().parse().map_err(|_| invalid("not a number"))?;
    if value <= T::default() {
        return Err(invalid("must be positive"));
    }
    Ok(value)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable is set to an unusable value.
    #[error("Invalid value {value:?} for {var}: {reason}")]
    Invalid {
        /// The offending variable.
        var: &'static str,
        /// The raw value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}
