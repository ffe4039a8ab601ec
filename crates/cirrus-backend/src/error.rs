// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cirrus-backend.

use std::time::Duration;

use cirrus_store::{Retryable, StoreError};
use thiserror::Error;

use crate::api::ProvisioningState;
use crate::installer::InstallerError;

/// Backend errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Document store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The caller no longer holds the lease on the document.
    #[error("Lost lease")]
    LeaseLost,

    /// A key or prefix was not in canonical lowercase form.
    #[error("Key {0:?} is not lower case")]
    InvalidKey(String),

    /// A key could not be parsed as a resource ID.
    #[error("Invalid resource ID {0:?}")]
    InvalidResourceId(String),

    /// A dequeued document was in a state no workflow handles.
    #[error("Unexpected provisioning state {0}")]
    UnexpectedProvisioningState(ProvisioningState),

    /// The installer reported a failure.
    #[error("Installer error: {0}")]
    Installer(#[from] InstallerError),

    /// A bounded wait elapsed.
    #[error("Timed out after {timeout:?} waiting for {what}")]
    Timeout {
        /// What was being waited for.
        what: &'static str,
        /// How long the wait lasted.
        timeout: Duration,
    },

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable identifier for logs and async operation records.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Store(e) => e.error_code(),
            Error::LeaseLost => "LEASE_LOST",
            Error::InvalidKey(_) => "INVALID_KEY",
            Error::InvalidResourceId(_) => "INVALID_RESOURCE_ID",
            Error::UnexpectedProvisioningState(_) => "UNEXPECTED_PROVISIONING_STATE",
            Error::Installer(_) => "INSTALLER_FAILED",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// True if the caller's lease was taken over or released.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Error::LeaseLost)
    }

    /// True if the underlying document does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Store(e) if e.is_not_found())
    }

    /// True if a write lost an optimistic-concurrency race.
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Error::Store(e) if e.is_precondition_failed())
    }
}

impl Retryable for Error {
    fn is_precondition_failed(&self) -> bool {
        Error::is_precondition_failed(self)
    }
}

/// Result type using the backend Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::LeaseLost.is_lease_lost());
        assert!(Error::from(StoreError::NotFound).is_not_found());
        assert!(Error::from(StoreError::PreconditionFailed).is_precondition_failed());
        assert!(!Error::LeaseLost.is_precondition_failed());
        assert!(Retryable::is_precondition_failed(&Error::from(
            StoreError::PreconditionFailed
        )));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::LeaseLost.error_code(), "LEASE_LOST");
        assert_eq!(
            Error::from(StoreError::NotFound).error_code(),
            StoreError::NotFound.error_code()
        );
        assert_eq!(
            Error::InvalidKey("/Subscriptions".into()).to_string(),
            "Key \"/Subscriptions\" is not lower case"
        );
    }
}
