// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cirrus-store.

use std::time::Duration;

use thiserror::Error;

/// Result type using StoreError.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by document store drivers and the typed collection layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The requested document does not exist.
    #[error("Document not found")]
    NotFound,

    /// A document (or trigger) with the same id already exists in the partition.
    #[error("Document already exists")]
    Conflict,

    /// The version token presented by the writer does not match the stored one.
    #[error("Precondition failed: version token mismatch")]
    PreconditionFailed,

    /// A lookup expected at most one document but matched several.
    #[error("Read {count} documents, expected <= 1")]
    AmbiguousResult {
        /// Number of documents that matched.
        count: usize,
    },

    /// A write referenced a pre-trigger that is not registered on the collection.
    #[error("Trigger '{0}' is not registered")]
    UnknownTrigger(String),

    /// The document body is not usable (not an object, missing id or version token).
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// A query or continuation token could not be interpreted.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// A store call did not complete within its deadline.
    #[error("Store call '{operation}' timed out after {timeout:?}")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::AmbiguousResult { .. } => "AMBIGUOUS_RESULT",
            Self::UnknownTrigger(_) => "UNKNOWN_TRIGGER",
            Self::InvalidDocument(_) => "INVALID_DOCUMENT",
            Self::InvalidQuery(_) => "INVALID_QUERY",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migrate(_) => "MIGRATION_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// True for a failed optimistic-concurrency check.
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed)
    }

    /// True when the document does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// True when a create collided with an existing document or trigger.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases = vec![
            (StoreError::NotFound, "NOT_FOUND"),
            (StoreError::Conflict, "CONFLICT"),
            (StoreError::PreconditionFailed, "PRECONDITION_FAILED"),
            (StoreError::AmbiguousResult { count: 2 }, "AMBIGUOUS_RESULT"),
            (
                StoreError::UnknownTrigger("renewLease".to_string()),
                "UNKNOWN_TRIGGER",
            ),
            (
                StoreError::Timeout {
                    operation: "replace",
                    timeout: Duration::from_secs(1),
                },
                "TIMEOUT",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.error_code(), expected, "wrong code for {:?}", error);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            StoreError::AmbiguousResult { count: 3 }.to_string(),
            "Read 3 documents, expected <= 1"
        );
        assert_eq!(
            StoreError::UnknownTrigger("renewLease".to_string()).to_string(),
            "Trigger 'renewLease' is not registered"
        );
    }

    #[test]
    fn test_classification() {
        assert!(StoreError::PreconditionFailed.is_precondition_failed());
        assert!(!StoreError::NotFound.is_precondition_failed());
        assert!(StoreError::NotFound.is_not_found());
        assert!(StoreError::Conflict.is_conflict());
    }
}
