// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource ID parsing.
//!
//! Cluster keys are resource IDs of the form
//! `/subscriptions/{sub}/resourcegroups/{rg}/providers/{ns}/{type}/{name}`,
//! optionally followed by further `{type}/{name}` pairs. The subscription ID is
//! the document partition key.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A parsed resource ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId {
    /// Tenant subscription, used as the partition key.
    pub subscription_id: String,
    /// Resource group name.
    pub resource_group: String,
    /// Provider namespace.
    pub provider: String,
    /// Type segments joined with `/`, e.g. `openshiftclusters`.
    pub resource_type: String,
    /// Name of the innermost resource.
    pub resource_name: String,
}

impl FromStr for ResourceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidResourceId(s.to_string());

        let rest = s.strip_prefix('/').ok_or_else(invalid)?;
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.len() < 8 || parts.len() % 2 != 0 || parts.iter().any(|p| p.is_empty()) {
            return Err(invalid());
        }
        if !parts[0].eq_ignore_ascii_case("subscriptions")
            || !parts[2].eq_ignore_ascii_case("resourcegroups")
            || !parts[4].eq_ignore_ascii_case("providers")
        {
            return Err(invalid());
        }

        let pairs = &parts[6..];
        let resource_type = pairs
            .iter()
            .step_by(2)
            .copied()
            .collect::<Vec<_>>()
            .join("/");
        let resource_name = pairs[pairs.len() - 1].to_string();

        Ok(Self {
            subscription_id: parts[1].to_string(),
            resource_group: parts[3].to_string(),
            provider: parts[5].to_string(),
            resource_type,
            resource_name,
        })
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/subscriptions/{}/resourcegroups/{}/providers/{}/{}/{}",
            self.subscription_id,
            self.resource_group,
            self.provider,
            self.resource_type,
            self.resource_name
        )
    }
}

/// Partition key for a cluster key.
pub fn partition_key(key: &str) -> Result<String> {
    Ok(key.parse::<ResourceId>()?.subscription_id)
}

/// Reject keys and prefixes that are not in canonical lowercase form.
pub fn check_lowercase(key: &str) -> Result<()> {
    if key.chars().any(char::is_uppercase) {
        return Err(Error::InvalidKey(key.to_string()));
    }
    Ok(())
}
