// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed document store.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
};
use sqlx::{Row, Sqlite, SqlitePool};
use tracing::debug;

use super::sql::{Arg, Dialect, Statement, paginate, select_page};
use super::{DocumentStore, QueryPage};
use crate::document::{
    Options, document_id, new_etag, strip_system_properties, with_system_properties,
};
use crate::error::{Result, StoreError};
use crate::migrations;
use crate::query::{ContinuationToken, Filter};
use crate::trigger::{self, Trigger, WriteOperation};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_args(mut query: SqliteQuery<'_>, args: Vec<Arg>) -> SqliteQuery<'_> {
    for arg in args {
        query = match arg {
            Arg::Text(s) => query.bind(s),
            Arg::Int(i) => query.bind(i),
            Arg::Path(segments) => query.bind(segments.join(".")),
            Arg::Json(value) => query.bind(value.to_string()),
        };
    }
    query
}

/// SQLite-backed [`DocumentStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool. The schema must already be migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect from a `sqlite:` URL, creating the database if missing, and run
    /// migrations. `sqlite::memory:` yields a private single-connection database.
    pub async fn connect(url: &str) -> Result<Self> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await?;

        migrations::run_sqlite(&pool).await?;
        debug!(in_memory, "SQLite document store ready");
        Ok(Self { pool })
    }

    /// Open (or create) a database file, creating parent directories as needed.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::InvalidQuery(format!(
                    "failed to create directory {:?}: {}",
                    parent, e
                ))
            })?;
        }
        Self::connect(&format!("sqlite:{}", path.to_string_lossy())).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_triggers(
        &self,
        collection: &str,
        options: &Options,
        write: WriteOperation,
    ) -> Result<Vec<Trigger>> {
        if options.pre_triggers.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT definition FROM triggers WHERE collection = ?")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;
        let registered = rows
            .iter()
            .map(|row| {
                let definition: String = row.try_get("definition")?;
                Ok(serde_json::from_str::<Trigger>(&definition)?)
            })
            .collect::<Result<Vec<_>>>()?;

        let resolved = trigger::resolve(
            |id| registered.iter().find(|t| t.id == id),
            &options.pre_triggers,
            write,
        )?;
        Ok(resolved.into_iter().cloned().collect())
    }

    async fn exists(&self, collection: &str, partition_key: &str, id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM documents WHERE collection = ? AND partition_key = ? AND id = ?",
        )
        .bind(collection)
        .bind(partition_key)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}

fn returned_body(row: &sqlx::sqlite::SqliteRow) -> Result<Value> {
    let body: String = row.try_get("body")?;
    let etag: String = row.try_get("etag")?;
    let ts: i64 = row.try_get("ts")?;
    Ok(with_system_properties(
        serde_json::from_str(&body)?,
        &etag,
        ts,
    ))
}

#[async_trait]
impl DocumentStore for SqliteStore {
    fn driver(&self) -> &'static str {
        "sqlite"
    }

    async fn create_trigger(&self, collection: &str, trigger: &Trigger) -> Result<()> {
        trigger.validate()?;
        let result = sqlx::query(
            r#"
            INSERT INTO triggers (collection, id, operation, definition)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (collection, id) DO NOTHING
            "#,
        )
        .bind(collection)
        .bind(&trigger.id)
        .bind(trigger.operation.as_str())
        .bind(serde_json::to_string(trigger)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict);
        }
        Ok(())
    }

    async fn create(
        &self,
        collection: &str,
        partition_key: &str,
        mut body: Value,
        options: &Options,
    ) -> Result<Value> {
        strip_system_properties(&mut body)?;
        let id = document_id(&body)?;
        let triggers = self
            .load_triggers(collection, options, WriteOperation::Create)
            .await?;

        let mut stmt = Statement::new(Dialect::Sqlite);
        stmt.push("INSERT INTO documents (collection, partition_key, id, etag, ts, body) VALUES (")
            .bind(Arg::Text(collection.to_string()))
            .push(", ")
            .bind(Arg::Text(partition_key.to_string()))
            .push(", ")
            .bind(Arg::Text(id))
            .push(", ")
            .bind(Arg::Text(new_etag()))
            .push(", ")
            .push_now()
            .push(", ")
            .push_body(&body, &triggers)?
            .push(") ON CONFLICT (collection, partition_key, id) DO NOTHING RETURNING body, etag, ts");

        let Statement { sql, args, .. } = stmt;
        let row = bind_args(sqlx::query(&sql), args)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => returned_body(&row),
            None => Err(StoreError::Conflict),
        }
    }

    async fn get(&self, collection: &str, partition_key: &str, id: &str) -> Result<Value> {
        let row = sqlx::query(
            r#"
            SELECT body, etag, ts FROM documents
            WHERE collection = ? AND partition_key = ? AND id = ?
            "#,
        )
        .bind(collection)
        .bind(partition_key)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => returned_body(&row),
            None => Err(StoreError::NotFound),
        }
    }

    async fn replace(
        &self,
        collection: &str,
        partition_key: &str,
        mut body: Value,
        if_match: Option<&str>,
        options: &Options,
    ) -> Result<Value> {
        strip_system_properties(&mut body)?;
        let id = document_id(&body)?;
        let triggers = self
            .load_triggers(collection, options, WriteOperation::Replace)
            .await?;

        let mut stmt = Statement::new(Dialect::Sqlite);
        stmt.push("UPDATE documents SET etag = ")
            .bind(Arg::Text(new_etag()))
            .push(", ts = ")
            .push_now()
            .push(", body = ")
            .push_body(&body, &triggers)?
            .push(" WHERE collection = ")
            .bind(Arg::Text(collection.to_string()))
            .push(" AND partition_key = ")
            .bind(Arg::Text(partition_key.to_string()))
            .push(" AND id = ")
            .bind(Arg::Text(id.clone()));
        if let Some(etag) = if_match {
            stmt.push(" AND etag = ").bind(Arg::Text(etag.to_string()));
        }
        stmt.push(" RETURNING body, etag, ts");

        let Statement { sql, args, .. } = stmt;
        let row = bind_args(sqlx::query(&sql), args)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            return returned_body(&row);
        }
        if if_match.is_some() && self.exists(collection, partition_key, &id).await? {
            Err(StoreError::PreconditionFailed)
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn delete(
        &self,
        collection: &str,
        partition_key: &str,
        id: &str,
        if_match: Option<&str>,
    ) -> Result<()> {
        let result = match if_match {
            Some(etag) => {
                sqlx::query(
                    r#"
                    DELETE FROM documents
                    WHERE collection = ? AND partition_key = ? AND id = ? AND etag = ?
                    "#,
                )
                .bind(collection)
                .bind(partition_key)
                .bind(id)
                .bind(etag)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "DELETE FROM documents WHERE collection = ? AND partition_key = ? AND id = ?",
                )
                .bind(collection)
                .bind(partition_key)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() > 0 {
            Ok(())
        } else if if_match.is_some() && self.exists(collection, partition_key, id).await? {
            Err(StoreError::PreconditionFailed)
        } else {
            Err(StoreError::NotFound)
        }
    }

    async fn query(
        &self,
        collection: &str,
        partition_key: Option<&str>,
        filter: &Filter,
        continuation: Option<&str>,
        max_item_count: usize,
    ) -> Result<QueryPage> {
        filter.validate()?;
        if max_item_count == 0 {
            return Err(StoreError::InvalidQuery("max_item_count must be positive".into()));
        }
        let after = continuation.map(ContinuationToken::decode).transpose()?;

        let Statement { sql, args, .. } = select_page(
            Dialect::Sqlite,
            collection,
            partition_key,
            filter,
            after.as_ref(),
            max_item_count + 1,
        );
        let rows = bind_args(sqlx::query(&sql), args)
            .fetch_all(&self.pool)
            .await?;

        let rows = rows
            .iter()
            .map(|row| {
                let pk: String = row.try_get("partition_key")?;
                let id: String = row.try_get("id")?;
                Ok((pk, id, returned_body(row)?))
            })
            .collect::<Result<Vec<_>>>()?;
        paginate(rows, max_item_count)
    }
}
