// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Declarative query filters.
//!
//! Filters are data, not strings: the memory driver evaluates them directly and
//! the SQL drivers render them into parameterised `WHERE` clauses. Missing
//! fields follow SQL `NULL` semantics, so `NotIn` never matches a document that
//! lacks the field, while `BeforeNow` treats a missing timestamp as zero.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StoreError};

/// Dotted path to a field inside a document body, e.g. `properties.provisioningState`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Build a path from its dotted form. Validation happens when the filter is used.
    pub fn new(dotted: &str) -> Self {
        Self(dotted.split('.').map(str::to_string).collect())
    }

    /// Path segments, outermost first.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Resolve the path against a body.
    pub fn lookup<'a>(&self, body: &'a Value) -> Option<&'a Value> {
        self.0
            .iter()
            .try_fold(body, |value, segment| value.get(segment.as_str()))
    }

    /// JSONPath form used by SQLite's JSON functions.
    pub(crate) fn json_path(&self) -> String {
        format!("$.{}", self.0.join("."))
    }

    fn validate(&self) -> Result<()> {
        let valid = !self.0.is_empty()
            && self.0.iter().all(|segment| {
                !segment.is_empty()
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
            });
        if valid {
            Ok(())
        } else {
            Err(StoreError::InvalidQuery(format!(
                "invalid field path '{}'",
                self.0.join(".")
            )))
        }
    }
}

/// A predicate over document bodies.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document.
    All,
    /// Field equals a scalar value.
    Eq(FieldPath, Value),
    /// String field starts with a prefix (case-sensitive).
    StartsWith(FieldPath, String),
    /// Field is present and not one of the listed scalar values.
    NotIn(FieldPath, Vec<Value>),
    /// Integer epoch-seconds field (missing counts as 0) is earlier than the
    /// store's own clock at evaluation time.
    BeforeNow(FieldPath),
    /// Every sub-filter matches.
    And(Vec<Filter>),
}

impl Filter {
    /// `path = value`
    pub fn eq(path: &str, value: impl Into<Value>) -> Self {
        Self::Eq(FieldPath::new(path), value.into())
    }

    /// `STARTSWITH(path, prefix)`
    pub fn starts_with(path: &str, prefix: impl Into<String>) -> Self {
        Self::StartsWith(FieldPath::new(path), prefix.into())
    }

    /// `NOT (path IN (values))`
    pub fn not_in<V: Into<Value>>(path: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self::NotIn(
            FieldPath::new(path),
            values.into_iter().map(Into::into).collect(),
        )
    }

    /// `(path ?? 0) < now`
    pub fn before_now(path: &str) -> Self {
        Self::BeforeNow(FieldPath::new(path))
    }

    /// Conjunction of filters.
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::And(filters.into_iter().collect())
    }

    /// Check paths and values are representable by every driver.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::All => Ok(()),
            Self::Eq(path, value) => {
                path.validate()?;
                validate_scalar(value)
            }
            Self::StartsWith(path, _) | Self::BeforeNow(path) => path.validate(),
            Self::NotIn(path, values) => {
                path.validate()?;
                if values.is_empty() {
                    return Err(StoreError::InvalidQuery(
                        "NOT IN requires at least one value".into(),
                    ));
                }
                values.iter().try_for_each(validate_scalar)
            }
            Self::And(filters) => filters.iter().try_for_each(Filter::validate),
        }
    }

    /// Evaluate against a body, with `now` as the store clock in epoch seconds.
    pub fn matches(&self, body: &Value, now: i64) -> bool {
        match self {
            Self::All => true,
            Self::Eq(path, expected) => path.lookup(body) == Some(expected),
            Self::StartsWith(path, prefix) => path
                .lookup(body)
                .and_then(Value::as_str)
                .is_some_and(|s| s.starts_with(prefix.as_str())),
            Self::NotIn(path, values) => match path.lookup(body) {
                None | Some(Value::Null) => false,
                Some(actual) => !values.contains(actual),
            },
            Self::BeforeNow(path) => match path.lookup(body) {
                None | Some(Value::Null) => 0 < now,
                Some(value) => value.as_i64().is_some_and(|ts| ts < now),
            },
            Self::And(filters) => filters.iter().all(|f| f.matches(body, now)),
        }
    }
}

fn validate_scalar(value: &Value) -> Result<()> {
    match value {
        Value::String(_) | Value::Bool(_) => Ok(()),
        Value::Number(n) if n.is_i64() => Ok(()),
        other => Err(StoreError::InvalidQuery(format!(
            "only string, integer and boolean values can be compared, got {}",
            other
        ))),
    }
}

/// Position after which the next page starts. Pages are ordered by
/// `(partition_key, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationToken {
    /// Partition key of the last document returned.
    #[serde(rename = "p")]
    pub partition_key: String,
    /// Id of the last document returned.
    #[serde(rename = "i")]
    pub id: String,
}

impl ContinuationToken {
    /// Opaque string form handed to callers.
    pub fn encode(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    /// Parse a token produced by [`encode`](Self::encode).
    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| StoreError::InvalidQuery(format!("bad continuation token: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::InvalidQuery(format!("bad continuation token: {}", e)))
    }

    /// True if `(partition_key, id)` sorts strictly after this token.
    pub(crate) fn precedes(&self, partition_key: &str, id: &str) -> bool {
        (self.partition_key.as_str(), self.id.as_str()) < (partition_key, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cluster(state: &str, lease_expires: Option<i64>) -> Value {
        let mut doc = json!({
            "key": "/subscriptions/sub/resourcegroups/rg/providers/p/c/one",
            "cluster": {"properties": {"provisioningState": state}},
        });
        if let Some(ts) = lease_expires {
            doc["leaseExpires"] = json!(ts);
        }
        doc
    }

    #[test]
    fn test_field_path_lookup() {
        let doc = cluster("Creating", None);
        let path = FieldPath::new("cluster.properties.provisioningState");
        assert_eq!(path.lookup(&doc), Some(&json!("Creating")));
        assert_eq!(FieldPath::new("cluster.missing").lookup(&doc), None);
        assert_eq!(path.json_path(), "$.cluster.properties.provisioningState");
    }

    #[test]
    fn test_eq_and_starts_with() {
        let doc = cluster("Creating", None);
        assert!(Filter::eq("cluster.properties.provisioningState", "Creating").matches(&doc, 0));
        assert!(!Filter::eq("cluster.properties.provisioningState", "Failed").matches(&doc, 0));
        assert!(Filter::starts_with("key", "/subscriptions/sub/").matches(&doc, 0));
        assert!(!Filter::starts_with("key", "/subscriptions/other/").matches(&doc, 0));
        assert!(!Filter::starts_with("cluster", "x").matches(&doc, 0));
    }

    #[test]
    fn test_not_in_with_missing_field() {
        let filter = Filter::not_in("cluster.properties.provisioningState", ["Succeeded", "Failed"]);
        assert!(filter.matches(&cluster("Creating", None), 0));
        assert!(!filter.matches(&cluster("Succeeded", None), 0));
        assert!(!filter.matches(&json!({"key": "k"}), 0));
    }

    #[test]
    fn test_before_now_treats_missing_as_zero() {
        let filter = Filter::before_now("leaseExpires");
        assert!(filter.matches(&cluster("Creating", None), 100));
        assert!(filter.matches(&cluster("Creating", Some(99)), 100));
        assert!(!filter.matches(&cluster("Creating", Some(100)), 100));
        assert!(!filter.matches(&cluster("Creating", Some(160)), 100));
        assert!(filter.matches(&json!({"leaseExpires": null}), 1));
    }

    #[test]
    fn test_and() {
        let filter = Filter::and([
            Filter::not_in("cluster.properties.provisioningState", ["Succeeded", "Failed"]),
            Filter::before_now("leaseExpires"),
        ]);
        assert!(filter.matches(&cluster("Deleting", Some(10)), 100));
        assert!(!filter.matches(&cluster("Deleting", Some(1000)), 100));
        assert!(!filter.matches(&cluster("Failed", Some(10)), 100));
        assert!(Filter::And(vec![]).matches(&json!({}), 0));
    }

    #[test]
    fn test_validate() {
        assert!(Filter::eq("a.b", "x").validate().is_ok());
        assert!(Filter::eq("a.b", 3).validate().is_ok());
        assert!(Filter::eq("a..b", "x").validate().is_err());
        assert!(Filter::eq("a'; DROP", "x").validate().is_err());
        assert!(Filter::eq("a", json!({"x": 1})).validate().is_err());
        assert!(Filter::eq("a", 1.5).validate().is_err());
        assert!(Filter::NotIn(FieldPath::new("a"), vec![]).validate().is_err());
        assert!(
            Filter::and([Filter::All, Filter::eq("bad path", "x")])
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_continuation_token_encoding() {
        let token = ContinuationToken {
            partition_key: "sub".to_string(),
            id: "doc-1".to_string(),
        };
        let encoded = token.encode().unwrap();
        assert_eq!(ContinuationToken::decode(&encoded).unwrap(), token);
        assert!(ContinuationToken::decode("not base64 !!").is_err());

        assert!(token.precedes("sub", "doc-2"));
        assert!(token.precedes("tub", "a"));
        assert!(!token.precedes("sub", "doc-1"));
        assert!(!token.precedes("aaa", "zzz"));
    }
}
