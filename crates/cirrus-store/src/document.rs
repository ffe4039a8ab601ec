// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Document contract and system properties.
//!
//! Drivers store the caller's JSON body verbatim, minus the system properties
//! they own. On every read they stamp the current version token (`_etag`) and
//! the server write time (`_ts`) back into the body, so typed documents can
//! carry both as ordinary serde fields.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

/// Name of the document id property.
pub const ID_PROPERTY: &str = "id";
/// Name of the version token property.
pub const ETAG_PROPERTY: &str = "_etag";
/// Name of the server write timestamp property (epoch seconds).
pub const TS_PROPERTY: &str = "_ts";

/// A typed document that can be stored in a [`Collection`](crate::Collection).
pub trait Document: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Document id, unique within its partition.
    fn id(&self) -> &str;

    /// Version token read with this document, if it has been stored.
    fn etag(&self) -> Option<&str>;
}

/// Per-write options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// Pre-write triggers to run atomically with the write, in order.
    pub pre_triggers: Vec<String>,
    /// Skip the version-token check.
    pub no_etag: bool,
}

impl Options {
    /// Options with no triggers and a version-token check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pre-write trigger by id.
    pub fn pre_trigger(mut self, id: impl Into<String>) -> Self {
        self.pre_triggers.push(id.into());
        self
    }

    /// Disable the version-token check.
    pub fn without_etag(mut self) -> Self {
        self.no_etag = true;
        self
    }
}

/// Generate a fresh version token.
pub fn new_etag() -> String {
    format!("\"{}\"", uuid::Uuid::new_v4())
}

/// Borrow the object map of a body, rejecting non-object documents.
pub(crate) fn as_object_mut(body: &mut Value) -> Result<&mut Map<String, Value>> {
    body.as_object_mut()
        .ok_or_else(|| StoreError::InvalidDocument("document body must be a JSON object".into()))
}

/// Extract the document id from a body.
pub(crate) fn document_id(body: &Value) -> Result<String> {
    match body.get(ID_PROPERTY) {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        _ => Err(StoreError::InvalidDocument(
            "document must have a non-empty string 'id'".into(),
        )),
    }
}

/// Remove driver-owned properties before a body is persisted.
pub(crate) fn strip_system_properties(body: &mut Value) -> Result<()> {
    let object = as_object_mut(body)?;
    object.remove(ETAG_PROPERTY);
    object.remove(TS_PROPERTY);
    Ok(())
}

/// Stamp driver-owned properties into a body that is being returned.
pub(crate) fn with_system_properties(mut body: Value, etag: &str, ts: i64) -> Value {
    if let Some(object) = body.as_object_mut() {
        object.insert(ETAG_PROPERTY.to_string(), Value::String(etag.to_string()));
        object.insert(TS_PROPERTY.to_string(), Value::from(ts));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_and_stamp_system_properties() {
        let mut body = json!({"id": "a", "_etag": "\"old\"", "_ts": 5, "value": 1});
        strip_system_properties(&mut body).unwrap();
        assert_eq!(body, json!({"id": "a", "value": 1}));

        let stamped = with_system_properties(body, "\"new\"", 42);
        assert_eq!(stamped["_etag"], "\"new\"");
        assert_eq!(stamped["_ts"], 42);
    }

    #[test]
    fn test_document_id_validation() {
        assert_eq!(document_id(&json!({"id": "x"})).unwrap(), "x");
        assert!(matches!(
            document_id(&json!({"id": ""})),
            Err(StoreError::InvalidDocument(_))
        ));
        assert!(matches!(
            document_id(&json!({"name": "x"})),
            Err(StoreError::InvalidDocument(_))
        ));
    }

    #[test]
    fn test_non_object_rejected() {
        let mut body = json!([1, 2, 3]);
        assert!(strip_system_properties(&mut body).is_err());
    }

    #[test]
    fn test_options_builder() {
        let options = Options::new().pre_trigger("renewLease").without_etag();
        assert_eq!(options.pre_triggers, vec!["renewLease".to_string()]);
        assert!(options.no_etag);
    }

    #[test]
    fn test_new_etag_is_unique_and_quoted() {
        let a = new_etag();
        let b = new_etag();
        assert_ne!(a, b);
        assert!(a.starts_with('"') && a.ends_with('"'));
    }
}
