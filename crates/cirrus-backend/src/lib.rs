// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cirrus Backend - Cluster Lifecycle Engine
//!
//! Drives managed clusters through create, update and delete by running an
//! installer against cluster documents claimed from a lease-based work queue.
//! Any number of backend processes can share one store; they coordinate
//! only through compare-and-swap writes and lease expiry.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        WorkerPool (per process)                      │
//! │   poll ─► dequeue ─► task ─► Manager ─► ClusterInstaller             │
//! │                       │                                              │
//! │                       └─► Heartbeat (lease renewal, delete watch)    │
//! └─────────────────────────────────────────────────────────────────────┘
//!            │                                   │
//!            ▼                                   ▼
//! ┌──────────────────────┐          ┌───────────────────────────┐
//! │  ClusterRepository   │          │  AsyncOperationTracker     │
//! │  Clusters collection │          │  AsyncOperations collection│
//! └──────────────────────┘          └───────────────────────────┘
//!            │                                   │
//!            └──────────────► cirrus-store ◄─────┘
//! ```
//!
//! # Provisioning State Machine
//!
//! ```text
//!   Creating ──┐
//!   Updating ──┼── success ──► Succeeded      (Deleting: document removed)
//!   Deleting ──┘
//!        │
//!        └──── error / cancel / dequeue cap ──► Failed
//! ```
//!
//! A delete requested while a create or update is running is observed by the
//! heartbeat, which cancels the task. The cancelled task ends `Failed`, after
//! which the document is moved back to `Deleting`:
//! `Creating → Deleting → Failed → Deleting`.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CIRRUS_DATABASE_URL` | Yes | - | `memory:`, `sqlite:<path>` or `postgres://...` |
//! | `CIRRUS_INSTANCE_ID` | No | random UUID | Worker identity written to `leaseOwner` |
//! | `CIRRUS_MAX_WORKERS` | No | `100` | Concurrent tasks per process |
//! | `CIRRUS_MAX_DEQUEUE_COUNT` | No | `5` | Dequeues before a document is failed outright |
//! | `CIRRUS_POLL_INTERVAL_MS` | No | `1000` | Sleep when the queue is empty |
//! | `CIRRUS_HEARTBEAT_INTERVAL_SECS` | No | `10` | Lease renewal tick |
//! | `CIRRUS_LEASE_TTL_SECS` | No | `60` | Lease duration |
//! | `CIRRUS_REQUEST_TIMEOUT_SECS` | No | `30` | Per store call deadline |
//! | `CIRRUS_OPERATION_TIMEOUT_SECS` | No | `21600` | Per workflow deadline |
//! | `CIRRUS_INSTALLER_COMMAND` | Yes (binary) | - | Installer executable and arguments |

#![deny(missing_docs)]

/// Persisted cluster and async operation documents.
pub mod api;

/// Configuration loaded from environment variables.
pub mod config;

/// Cluster and async operation repositories.
pub mod database;

/// Error types for backend operations.
pub mod error;

mod heartbeat;

/// Installer trait, mock and external-command implementations.
pub mod installer;

/// Lifecycle state machine.
pub mod manager;

/// Resource ID parsing and key canonicalisation.
pub mod resource_id;

/// Embeddable runtime.
pub mod runtime;

/// Bounded polling.
pub mod wait;

/// Worker pool: dequeue, task supervision and lease ending.
pub mod worker_pool;

pub use api::{AsyncOperationDocument, ClusterDocument, ProvisioningState};
pub use error::{Error, Result};
pub use runtime::BackendRuntime;
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
