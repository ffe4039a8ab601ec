// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQL rendering shared by the SQLite and PostgreSQL drivers.
//!
//! Filters and triggers compile to statement fragments with bind arguments
//! collected alongside. Field paths are always bound, never interpolated.

use serde_json::Value;

use crate::error::Result;
use crate::query::{ContinuationToken, FieldPath, Filter};
use crate::trigger::{Trigger, TriggerAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    Sqlite,
    Postgres,
}

/// A bind argument for a rendered statement.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Arg {
    Text(String),
    Int(i64),
    /// A text array, used for PostgreSQL `#>` paths.
    Path(Vec<String>),
    /// A JSON value, bound as `jsonb` on PostgreSQL.
    Json(Value),
}

/// Accumulates SQL text and bind arguments in placeholder order.
#[derive(Debug)]
pub(crate) struct Statement {
    dialect: Dialect,
    pub(crate) sql: String,
    pub(crate) args: Vec<Arg>,
}

impl Statement {
    pub(crate) fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            args: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    /// Bind an argument and append its placeholder.
    pub(crate) fn bind(&mut self, arg: Arg) -> &mut Self {
        self.args.push(arg);
        match self.dialect {
            Dialect::Sqlite => self.sql.push('?'),
            Dialect::Postgres => {
                let n = self.args.len();
                self.sql.push_str(&format!("${}", n));
            }
        }
        self
    }

    /// The store clock in epoch seconds.
    pub(crate) fn push_now(&mut self) -> &mut Self {
        match self.dialect {
            Dialect::Sqlite => self.push("CAST(strftime('%s','now') AS INTEGER)"),
            Dialect::Postgres => self.push("EXTRACT(EPOCH FROM now())::bigint"),
        }
    }

    /// `documents.body` value at `path`, as JSON (`#>`) on PostgreSQL and as
    /// an SQL scalar on SQLite.
    fn push_field(&mut self, path: &FieldPath) -> &mut Self {
        match self.dialect {
            Dialect::Sqlite => self
                .push("json_extract(body, ")
                .bind(Arg::Text(path.json_path()))
                .push(")"),
            Dialect::Postgres => self
                .push("(body #> ")
                .bind(Arg::Path(path.segments().to_vec()))
                .push("::text[])"),
        }
    }

    fn push_scalar(&mut self, value: &Value) -> &mut Self {
        match self.dialect {
            Dialect::Sqlite => {
                let arg = match value {
                    Value::Bool(b) => Arg::Int(i64::from(*b)),
                    Value::Number(n) => Arg::Int(n.as_i64().unwrap_or_default()),
                    Value::String(s) => Arg::Text(s.clone()),
                    other => Arg::Text(other.to_string()),
                };
                self.bind(arg)
            }
            Dialect::Postgres => self.bind(Arg::Json(value.clone())).push("::jsonb"),
        }
    }

    /// Render a filter as a boolean expression. The filter must be validated.
    pub(crate) fn push_filter(&mut self, filter: &Filter) -> &mut Self {
        match filter {
            Filter::All => self.push("1 = 1"),
            Filter::Eq(path, value) => {
                self.push_field(path).push(" = ");
                self.push_scalar(value)
            }
            Filter::StartsWith(path, prefix) => match self.dialect {
                Dialect::Sqlite => {
                    self.push("(json_type(body, ")
                        .bind(Arg::Text(path.json_path()))
                        .push(") = 'text' AND substr(");
                    self.push_field(path)
                        .push(", 1, length(")
                        .bind(Arg::Text(prefix.clone()))
                        .push(")) = ")
                        .bind(Arg::Text(prefix.clone()))
                        .push(")")
                }
                Dialect::Postgres => {
                    self.push("(jsonb_typeof(");
                    self.push_field(path)
                        .push(") = 'string' AND starts_with(body #>> ")
                        .bind(Arg::Path(path.segments().to_vec()))
                        .push("::text[], ")
                        .bind(Arg::Text(prefix.clone()))
                        .push("))")
                }
            },
            Filter::NotIn(path, values) => {
                match self.dialect {
                    Dialect::Sqlite => {
                        self.push("(");
                        self.push_field(path).push(" IS NOT NULL AND ");
                    }
                    Dialect::Postgres => {
                        self.push("(jsonb_typeof(");
                        self.push_field(path).push(") <> 'null' AND ");
                    }
                }
                self.push_field(path).push(" NOT IN (");
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        self.push(", ");
                    }
                    self.push_scalar(value);
                }
                self.push("))")
            }
            Filter::BeforeNow(path) => {
                match self.dialect {
                    Dialect::Sqlite => {
                        self.push("COALESCE(");
                        self.push_field(path);
                    }
                    Dialect::Postgres => {
                        self.push("COALESCE((body #>> ")
                            .bind(Arg::Path(path.segments().to_vec()))
                            .push("::text[])::bigint");
                    }
                }
                self.push(", 0) < ").push_now()
            }
            Filter::And(filters) => {
                if filters.is_empty() {
                    return self.push("1 = 1");
                }
                self.push("(");
                for (i, f) in filters.iter().enumerate() {
                    if i > 0 {
                        self.push(" AND ");
                    }
                    self.push_filter(f);
                }
                self.push(")")
            }
        }
    }

    /// Render the new body expression: the bound base body with each trigger
    /// applied in order, using the store clock.
    pub(crate) fn push_body(&mut self, body: &Value, triggers: &[Trigger]) -> Result<&mut Self> {
        let open = match self.dialect {
            Dialect::Sqlite => "json_set(",
            Dialect::Postgres => "jsonb_set(",
        };
        for _ in triggers {
            self.push(open);
        }
        match self.dialect {
            Dialect::Sqlite => self
                .push("json(")
                .bind(Arg::Text(serde_json::to_string(body)?))
                .push(")"),
            Dialect::Postgres => self.bind(Arg::Json(body.clone())).push("::jsonb"),
        };
        for trigger in triggers {
            let TriggerAction::SetEpochOffset { field, offset_secs } = &trigger.action;
            let path = FieldPath::new(field);
            match self.dialect {
                Dialect::Sqlite => {
                    self.push(", ").bind(Arg::Text(path.json_path())).push(", ");
                    self.push_now().push(" + ").bind(Arg::Int(*offset_secs)).push(")");
                }
                Dialect::Postgres => {
                    self.push(", ")
                        .bind(Arg::Path(path.segments().to_vec()))
                        .push("::text[], to_jsonb(");
                    self.push_now()
                        .push(" + ")
                        .bind(Arg::Int(*offset_secs))
                        .push("::bigint), true)");
                }
            }
        }
        Ok(self)
    }

    /// Keyset condition selecting rows strictly after the token.
    pub(crate) fn push_after(&mut self, token: &ContinuationToken) -> &mut Self {
        self.push("(partition_key > ")
            .bind(Arg::Text(token.partition_key.clone()))
            .push(" OR (partition_key = ")
            .bind(Arg::Text(token.partition_key.clone()))
            .push(" AND id > ")
            .bind(Arg::Text(token.id.clone()))
            .push("))")
    }
}

/// Build the page query: `SELECT body, etag, ts ... LIMIT page + 1`.
pub(crate) fn select_page(
    dialect: Dialect,
    collection: &str,
    partition_key: Option<&str>,
    filter: &Filter,
    after: Option<&ContinuationToken>,
    limit: usize,
) -> Statement {
    let mut stmt = Statement::new(dialect);
    stmt.push("SELECT partition_key, id, body, etag, ts FROM documents WHERE collection = ")
        .bind(Arg::Text(collection.to_string()));
    if let Some(pk) = partition_key {
        stmt.push(" AND partition_key = ").bind(Arg::Text(pk.to_string()));
    }
    if let Some(token) = after {
        stmt.push(" AND ").push_after(token);
    }
    stmt.push(" AND ").push_filter(filter);
    stmt.push(" ORDER BY partition_key, id LIMIT ")
        .bind(Arg::Int(i64::try_from(limit).unwrap_or(i64::MAX)));
    stmt
}

/// Cut a `limit + 1` row fetch down to a page and its continuation.
pub(crate) fn paginate(
    mut rows: Vec<(String, String, Value)>,
    page_size: usize,
) -> Result<super::QueryPage> {
    let has_more = rows.len() > page_size;
    rows.truncate(page_size);
    let continuation = match (has_more, rows.last()) {
        (true, Some((pk, id, _))) => Some(
            ContinuationToken {
                partition_key: pk.clone(),
                id: id.clone(),
            }
            .encode()?,
        ),
        _ => None,
    };
    Ok(super::QueryPage {
        documents: rows.into_iter().map(|(_, _, body)| body).collect(),
        continuation,
    })
}
