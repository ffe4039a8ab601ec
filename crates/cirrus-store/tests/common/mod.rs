// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared test infrastructure for cirrus-store integration tests.
//!
//! Provides one store per available driver so the same checks run against
//! memory, a file-backed SQLite database and, when `TEST_CIRRUS_DATABASE_URL`
//! is set, PostgreSQL.

#![allow(dead_code)]

use std::sync::Arc;

use cirrus_store::{DocumentStore, MemoryStore, PostgresStore, SqliteStore};
use tempfile::TempDir;

/// A driver under test. Keeps any temporary directory alive for its lifetime.
pub struct TestStore {
    pub name: &'static str,
    pub store: Arc<dyn DocumentStore>,
    /// Collection name unique to this run, so shared databases stay isolated.
    pub collection: String,
    _dir: Option<TempDir>,
}

fn unique_collection() -> String {
    format!("Test{}", uuid::Uuid::new_v4().simple())
}

/// Every driver available in this environment.
pub async fn all_stores() -> Vec<TestStore> {
    let mut stores = vec![TestStore {
        name: "memory",
        store: Arc::new(MemoryStore::new()),
        collection: unique_collection(),
        _dir: None,
    }];

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let sqlite = SqliteStore::from_path(dir.path().join("store.db"))
        .await
        .expect("Failed to open SQLite store");
    stores.push(TestStore {
        name: "sqlite",
        store: Arc::new(sqlite),
        collection: unique_collection(),
        _dir: Some(dir),
    });

    match std::env::var("TEST_CIRRUS_DATABASE_URL") {
        Ok(url) => match PostgresStore::connect(&url).await {
            Ok(pg) => stores.push(TestStore {
                name: "postgres",
                store: Arc::new(pg),
                collection: unique_collection(),
                _dir: None,
            }),
            Err(e) => eprintln!("Skipping PostgreSQL driver: could not connect: {}", e),
        },
        Err(_) => eprintln!("Skipping PostgreSQL driver: TEST_CIRRUS_DATABASE_URL not set"),
    }

    stores
}
