// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cirrus Store - Versioned Document Store
//!
//! This crate provides a small document database abstraction with the
//! primitives a lease-based work queue needs: optimistic concurrency on a
//! per-document version token, server-side pre-write triggers, and lazy
//! paginated queries.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   cirrus-backend repositories                 │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Collection<T>   typed bodies, etag handling, call deadlines  │
//! └──────────────────────────────────────────────────────────────┘
//!                               │ dyn DocumentStore
//!            ┌──────────────────┼───────────────────┐
//!            ▼                  ▼                   ▼
//!     ┌─────────────┐    ┌─────────────┐     ┌─────────────┐
//!     │ MemoryStore │    │ SqliteStore │     │PostgresStore│
//!     └─────────────┘    └─────────────┘     └─────────────┘
//! ```
//!
//! # Document Model
//!
//! | Property | Owner | Description |
//! |----------|-------|-------------|
//! | `id` | caller | Unique within the partition |
//! | `_etag` | store | Version token, replaced on every write |
//! | `_ts` | store | Server write time, epoch seconds |
//!
//! A replace that presents a stale `_etag` fails with
//! [`StoreError::PreconditionFailed`] and changes nothing. Writers recover by
//! re-reading, usually through [`retry_on_precondition_failed`].
//!
//! # Triggers
//!
//! A [`Trigger`] registered on a collection can be attached to a write by id.
//! It mutates the body inside the same atomic write, using the store's clock,
//! which is how lease expiry is stamped without a client clock read.
//!
//! # Drivers
//!
//! | URL | Driver |
//! |-----|--------|
//! | `memory:` | [`MemoryStore`] |
//! | `sqlite:<path>`, `sqlite::memory:` | [`SqliteStore`] |
//! | `postgres://...` | [`PostgresStore`] |

#![deny(missing_docs)]

/// Typed collection facade and lazy query iterator.
pub mod collection;

/// Document contract, write options and system properties.
pub mod document;

/// Error types for store operations.
pub mod error;

/// Embedded schema migrations for the SQL drivers.
pub mod migrations;

/// Driver trait and its memory, SQLite and PostgreSQL implementations.
pub mod persistence;

/// Declarative filters and continuation tokens.
pub mod query;

/// Bounded retry for precondition failures.
pub mod retry;

/// Declarative pre-write triggers.
pub mod trigger;

pub use collection::{Collection, DocumentIterator};
pub use document::{Document, Options};
pub use error::{Result, StoreError};
pub use persistence::{
    DocumentStore, MemoryStore, PostgresStore, QueryPage, SqliteStore, connect,
};
pub use query::{ContinuationToken, FieldPath, Filter};
pub use retry::{RetryPolicy, Retryable, retry_on_precondition_failed};
pub use trigger::{Trigger, TriggerAction, TriggerOperation};
