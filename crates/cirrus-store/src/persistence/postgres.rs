// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed document store.
//!
//! Bodies live in a `JSONB` column. Filters compile to `#>` / `#>>` path
//! expressions and triggers to nested `jsonb_set` calls evaluated with the
//! database clock inside the same `INSERT`/`UPDATE`.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row};
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

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

fn bind_args(mut query: PgQuery<'_>, args: Vec<Arg>) -> PgQuery<'_> {
    for arg in args {
        query = match arg {
            Arg::Text(s) => query.bind(s),
            Arg::Int(i) => query.bind(i),
            Arg::Path(segments) => query.bind(segments),
            Arg::Json(value) => query.bind(Json(value)),
        };
    }
    query
}

fn returned_body(row: &PgRow) -> Result<Value> {
    let Json(body): Json<Value> = row.try_get("body")?;
    let etag: String = row.try_get("etag")?;
    let ts: i64 = row.try_get("ts")?;
    Ok(with_system_properties(body, &etag, ts))
}

/// PostgreSQL-backed [`DocumentStore`].
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool. The schema must already be migrated.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect from a `postgres://` URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        migrations::run_postgres(&pool).await?;
        debug!("PostgreSQL document store ready");
        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
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
        let rows = sqlx::query("SELECT definition FROM triggers WHERE collection = $1")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;
        let registered = rows
            .iter()
            .map(|row| {
                let Json(trigger): Json<Trigger> = row.try_get("definition")?;
                Ok(trigger)
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
            "SELECT 1 FROM documents WHERE collection = $1 AND partition_key = $2 AND id = $3",
        )
        .bind(collection)
        .bind(partition_key)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    fn driver(&self) -> &'static str {
        "postgres"
    }

    async fn create_trigger(&self, collection: &str, trigger: &Trigger) -> Result<()> {
        trigger.validate()?;
        let result = sqlx::query(
            r#"
            INSERT INTO triggers (collection, id, operation, definition)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (collection, id) DO NOTHING
            "#,
        )
        .bind(collection)
        .bind(&trigger.id)
        .bind(trigger.operation.as_str())
        .bind(Json(trigger))
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

        let mut stmt = Statement::new(Dialect::Postgres);
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
            WHERE collection = $1 AND partition_key = $2 AND id = $3
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

        let mut stmt = Statement::new(Dialect::Postgres);
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
        let result = sqlx::query(
            r#"
            DELETE FROM documents
            WHERE collection = $1 AND partition_key = $2 AND id = $3
              AND ($4::text IS NULL OR etag = $4)
            "#,
        )
        .bind(collection)
        .bind(partition_key)
        .bind(id)
        .bind(if_match)
        .execute(&self.pool)
        .await?;

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
            Dialect::Postgres,
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
