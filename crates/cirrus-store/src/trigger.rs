// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pre-write triggers.
//!
//! A trigger is registered on a collection under an id and named by writers in
//! [`Options::pre_triggers`](crate::Options). It runs inside the write itself:
//! the SQL drivers compile it into the `INSERT`/`UPDATE` statement using the
//! database clock, and the memory driver applies it while holding the lock that
//! guards the compare-and-swap. No client clock read is involved.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::as_object_mut;
use crate::error::{Result, StoreError};
use crate::query::FieldPath;

/// Which writes a trigger may be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerOperation {
    /// Creates and replaces.
    All,
    /// Creates only.
    Create,
    /// Replaces only.
    Replace,
}

impl TriggerOperation {
    /// Storage form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "All",
            Self::Create => "Create",
            Self::Replace => "Replace",
        }
    }

    /// Whether a trigger registered for `self` may run on `write`.
    pub fn applies_to(&self, write: WriteOperation) -> bool {
        matches!(
            (self, write),
            (Self::All, _)
                | (Self::Create, WriteOperation::Create)
                | (Self::Replace, WriteOperation::Replace)
        )
    }
}

/// A write that may run triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOperation {
    /// Insert of a new document.
    Create,
    /// Conditional replace of an existing document.
    Replace,
}

/// Body mutation performed by a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TriggerAction {
    /// Set a top-level field to the store's current epoch seconds plus an offset.
    #[serde(rename_all = "camelCase")]
    SetEpochOffset {
        /// Top-level field name.
        field: String,
        /// Seconds added to the store clock.
        offset_secs: i64,
    },
}

/// A named pre-write trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    /// Trigger id, unique within a collection.
    pub id: String,
    /// Writes the trigger may be attached to.
    pub operation: TriggerOperation,
    /// Mutation applied to the body.
    pub action: TriggerAction,
}

impl Trigger {
    /// A trigger stamping `field = now + offset_secs`.
    pub fn set_epoch_offset(
        id: impl Into<String>,
        operation: TriggerOperation,
        field: impl Into<String>,
        offset_secs: i64,
    ) -> Self {
        Self {
            id: id.into(),
            operation,
            action: TriggerAction::SetEpochOffset {
                field: field.into(),
                offset_secs,
            },
        }
    }

    /// Reject definitions a driver cannot compile.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(StoreError::InvalidQuery("trigger id must not be empty".into()));
        }
        match &self.action {
            TriggerAction::SetEpochOffset { field, .. } => {
                let path = FieldPath::new(field);
                if path.segments().len() != 1 {
                    return Err(StoreError::InvalidQuery(format!(
                        "trigger '{}' must target a top-level field, got '{}'",
                        self.id, field
                    )));
                }
                crate::query::Filter::BeforeNow(path).validate()
            }
        }
    }

    /// Apply the trigger in process, with `now` taken from the store clock.
    pub fn apply(&self, body: &mut Value, now: i64) -> Result<()> {
        match &self.action {
            TriggerAction::SetEpochOffset { field, offset_secs } => {
                as_object_mut(body)?.insert(field.clone(), Value::from(now + offset_secs));
                Ok(())
            }
        }
    }
}

/// Resolve trigger ids against the registered set, checking each applies to `write`.
pub(crate) fn resolve<'a>(
    registered: impl Fn(&str) -> Option<&'a Trigger>,
    ids: &[String],
    write: WriteOperation,
) -> Result<Vec<&'a Trigger>> {
    ids.iter()
        .map(|id| match registered(id) {
            Some(trigger) if trigger.operation.applies_to(write) => Ok(trigger),
            _ => Err(StoreError::UnknownTrigger(id.clone())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn renew_lease() -> Trigger {
        Trigger::set_epoch_offset("renewLease", TriggerOperation::All, "leaseExpires", 60)
    }

    #[test]
    fn test_apply_sets_field_relative_to_now() {
        let mut body = json!({"id": "a"});
        renew_lease().apply(&mut body, 1_000).unwrap();
        assert_eq!(body["leaseExpires"], 1_060);

        renew_lease().apply(&mut body, 2_000).unwrap();
        assert_eq!(body["leaseExpires"], 2_060);
    }

    #[test]
    fn test_validate() {
        assert!(renew_lease().validate().is_ok());
        let nested =
            Trigger::set_epoch_offset("t", TriggerOperation::All, "lease.expires", 60);
        assert!(nested.validate().is_err());
        let unnamed = Trigger::set_epoch_offset("", TriggerOperation::All, "x", 1);
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn test_operation_applies_to() {
        assert!(TriggerOperation::All.applies_to(WriteOperation::Create));
        assert!(TriggerOperation::All.applies_to(WriteOperation::Replace));
        assert!(TriggerOperation::Create.applies_to(WriteOperation::Create));
        assert!(!TriggerOperation::Create.applies_to(WriteOperation::Replace));
        assert!(!TriggerOperation::Replace.applies_to(WriteOperation::Create));
    }

    #[test]
    fn test_serde_definition() {
        let value = serde_json::to_value(renew_lease()).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "renewLease",
                "operation": "All",
                "action": {"type": "setEpochOffset", "field": "leaseExpires", "offsetSecs": 60},
            })
        );
        let back: Trigger = serde_json::from_value(value).unwrap();
        assert_eq!(back, renew_lease());
    }

    #[test]
    fn test_resolve_rejects_unknown_and_mismatched() {
        let create_only = Trigger::set_epoch_offset("stamp", TriggerOperation::Create, "x", 0);
        let registered = |id: &str| (id == "stamp").then_some(&create_only);

        let ok = resolve(registered, &["stamp".to_string()], WriteOperation::Create).unwrap();
        assert_eq!(ok.len(), 1);

        assert!(matches!(
            resolve(registered, &["stamp".to_string()], WriteOperation::Replace),
            Err(StoreError::UnknownTrigger(_))
        ));
        assert!(matches!(
            resolve(registered, &["other".to_string()], WriteOperation::Create),
            Err(StoreError::UnknownTrigger(_))
        ));
    }
}
