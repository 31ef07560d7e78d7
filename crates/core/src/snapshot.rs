//! Deployment snapshot: the latest authoritative state of the resource tracking a rollout.

use k8s_openapi::api::apps::v1::DeploymentStatus;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("watch envelope has no object")]
    MissingObject,
    #[error("resource state is not a JSON object")]
    NotAnObject,
    #[error("resource state missing metadata.name")]
    MissingName,
}

/// Whole-object snapshot. Opaque beyond identity; replaced, never merged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentSnapshot {
    pub name: String,
    pub namespace: Option<String>,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    /// Raw object with `metadata.managedFields` removed.
    pub raw: serde_json::Value,
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

impl DeploymentSnapshot {
    /// Decode the `object` payload of a watch message.
    pub fn from_object(mut raw: serde_json::Value) -> Result<Self, DecodeError> {
        if !raw.is_object() {
            return Err(DecodeError::NotAnObject);
        }
        strip_managed_fields(&mut raw);
        let meta_str = |key: &str| raw.pointer(&format!("/metadata/{}", key)).and_then(|v| v.as_str()).map(str::to_string);
        let name = meta_str("name").filter(|n| !n.is_empty()).ok_or(DecodeError::MissingName)?;
        let namespace = meta_str("namespace");
        let uid = meta_str("uid");
        let resource_version = meta_str("resourceVersion");
        Ok(Self { name, namespace, uid, resource_version, raw })
    }

    /// Rollout summary derived from `spec.replicas` and `status`.
    pub fn rollout(&self) -> RolloutStatus {
        let desired = self
            .raw
            .pointer("/spec/replicas")
            .and_then(|v| v.as_i64())
            .and_then(|v| i32::try_from(v).ok())
            .unwrap_or(1);
        // A status the typed model cannot read is shown as an empty one.
        let status: DeploymentStatus = self
            .raw
            .get("status")
            .cloned()
            .and_then(|s| serde_json::from_value(s).ok())
            .unwrap_or_default();
        let conditions = status
            .conditions
            .unwrap_or_default()
            .into_iter()
            .map(|c| RolloutCondition { kind: c.type_, status: c.status, reason: c.reason, message: c.message })
            .collect();
        RolloutStatus {
            desired,
            replicas: status.replicas.unwrap_or(0),
            updated: status.updated_replicas.unwrap_or(0),
            ready: status.ready_replicas.unwrap_or(0),
            available: status.available_replicas.unwrap_or(0),
            unavailable: status.unavailable_replicas.unwrap_or(0),
            conditions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolloutCondition {
    pub kind: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RolloutStatus {
    pub desired: i32,
    pub replicas: i32,
    pub updated: i32,
    pub ready: i32,
    pub available: i32,
    pub unavailable: i32,
    pub conditions: Vec<RolloutCondition>,
}

impl RolloutStatus {
    /// All desired replicas are updated and available, and no old ones remain.
    pub fn is_complete(&self) -> bool {
        self.updated >= self.desired && self.available >= self.desired && self.replicas <= self.desired
    }

    pub fn condition(&self, kind: &str) -> Option<&RolloutCondition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    pub fn summary(&self) -> String {
        let phase = if self.is_complete() { "ready" } else { "rolling out" };
        format!(
            "{}/{} ready, {} up-to-date, {} available ({})",
            self.ready, self.desired, self.updated, self.available, phase
        )
    }
}
