// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted document types.
//!
//! Every struct keeps the fields it does not model in an `extra` map, so a
//! read-modify-write by this crate never drops data written by a newer
//! component.

use std::fmt;

use chrono::{DateTime, Utc};
use cirrus_store::Document;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle phase of a cluster or async operation.
///
/// Values this crate does not know deserialize into [`Unknown`](Self::Unknown)
/// so a single corrupt document can be dequeued and failed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProvisioningState {
    /// Install in progress.
    Creating,
    /// Update in progress.
    Updating,
    /// Delete in progress.
    Deleting,
    /// Last operation finished.
    Succeeded,
    /// Last operation failed.
    Failed,
    /// Anything else found in storage.
    Unknown(String),
}

impl ProvisioningState {
    /// Wire name of the state.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Creating => "Creating",
            Self::Updating => "Updating",
            Self::Deleting => "Deleting",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown(s) => s,
        }
    }

    /// True for Succeeded and Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl Default for ProvisioningState {
    fn default() -> Self {
        Self::Unknown(String::new())
    }
}

impl From<String> for ProvisioningState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Creating" => Self::Creating,
            "Updating" => Self::Updating,
            "Deleting" => Self::Deleting,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown(s),
        }
    }
}

impl From<ProvisioningState> for String {
    fn from(state: ProvisioningState) -> Self {
        match state {
            ProvisioningState::Unknown(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Properties of a cluster the lifecycle engine reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterProperties {
    /// Phase of the operation in progress, or the outcome of the last one.
    #[serde(default)]
    pub provisioning_state: ProvisioningState,
    /// State that was in progress when the last failure happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_provisioning_state: Option<ProvisioningState>,
    /// Installer-owned payload.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Public view of a managed cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Resource ID as given by the client.
    #[serde(default)]
    pub id: String,
    /// Resource name.
    #[serde(default)]
    pub name: String,
    /// Resource type, e.g. `Microsoft.RedHatOpenShift/openShiftClusters`.
    #[serde(rename = "type", default)]
    pub resource_type: String,
    /// Azure region.
    #[serde(default)]
    pub location: String,
    /// Provisioning properties.
    #[serde(default)]
    pub properties: ClusterProperties,
    /// Fields the lifecycle engine does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One stored document per managed cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDocument {
    /// Store id, derived from `key` by [`cluster_document_id`].
    pub id: String,
    /// Lowercase resource ID, unique and immutable.
    pub key: String,
    /// Subscription ID parsed from `key`.
    #[serde(default)]
    pub partition_key: String,
    /// Version token assigned by the store.
    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Last write time, epoch seconds.
    #[serde(rename = "_ts", default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,

    /// Worker instance holding the lease, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    /// Epoch seconds; stamped by the store's `renewLease` trigger.
    #[serde(default)]
    pub lease_expires: i64,
    /// Times the document was dequeued since it last succeeded.
    #[serde(default)]
    pub dequeues: u32,
    /// Async operation tracking the request in progress.
    #[serde(
        rename = "asyncOperationID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub async_operation_id: Option<String>,

    /// The cluster resource.
    #[serde(default)]
    pub cluster: Cluster,
    /// Fields the lifecycle engine does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Store id of the document for `key`.
///
/// The id is a name-based UUID of the key, so a second document for the same
/// cluster collides with the first on create.
pub fn cluster_document_id(key: &str) -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

impl ClusterDocument {
    /// A fresh, unleased document in `state`. The partition key is derived by
    /// the repository on create.
    pub fn new(key: impl Into<String>, state: ProvisioningState) -> Self {
        let key = key.into();
        Self {
            id: cluster_document_id(&key),
            cluster: Cluster {
                id: key.clone(),
                properties: ClusterProperties {
                    provisioning_state: state,
                    ..Default::default()
                },
                ..Default::default()
            },
            key,
            ..Default::default()
        }
    }

    /// Current provisioning state.
    pub fn state(&self) -> &ProvisioningState {
        &self.cluster.properties.provisioning_state
    }

    /// Set the provisioning state.
    pub fn set_state(&mut self, state: ProvisioningState) {
        self.cluster.properties.provisioning_state = state;
    }
}

impl Document for ClusterDocument {
    fn id(&self) -> &str {
        &self.id
    }

    fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }
}

/// Error body exposed to API pollers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudErrorBody {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl CloudErrorBody {
    /// The generic failure reported for any installer error. Details stay in
    /// the logs.
    pub fn internal_server_error() -> Self {
        Self {
            code: "InternalServerError".to_string(),
            message: "Internal server error.".to_string(),
        }
    }
}

/// Externally pollable status of a long-running operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncOperation {
    /// Operation id, matching the document id.
    #[serde(default)]
    pub id: String,
    /// Current state of the operation.
    #[serde(default)]
    pub provisioning_state: ProvisioningState,
    /// When the request was accepted.
    pub start_time: DateTime<Utc>,
    /// When the operation reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Error reported to the poller on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CloudErrorBody>,
    /// Fields the lifecycle engine does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One stored document per async operation, partitioned by its own id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncOperationDocument {
    /// Store id; also the partition key.
    pub id: String,
    /// Version token assigned by the store.
    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Last write time, epoch seconds.
    #[serde(rename = "_ts", default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,

    /// The pollable status.
    pub async_operation: AsyncOperation,
    /// Snapshot of the cluster when the operation finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<Cluster>,
    /// Fields the lifecycle engine does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AsyncOperationDocument {
    /// A new operation started now.
    pub fn new(state: ProvisioningState) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            async_operation: AsyncOperation {
                id: id.clone(),
                provisioning_state: state,
                start_time: Utc::now(),
                end_time: None,
                error: None,
                extra: Map::new(),
            },
            id,
            etag: None,
            ts: None,
            cluster: None,
            extra: Map::new(),
        }
    }
}

impl Document for AsyncOperationDocument {
    fn id(&self) -> &str {
        &self.id
    }

    fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }
}
