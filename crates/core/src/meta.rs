//! Object metadata common to every managed kind.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// API group/version served by this control plane.
pub const API_VERSION: &str = "caravel.dev/v1";

/// Identifies the schema of a serialized object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeMeta {
    #[serde(default)]
    pub kind: String,
    #[serde(default, rename = "apiVersion")]
    pub api_version: String,
}

impl TypeMeta {
    pub fn for_kind(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            api_version: API_VERSION.to_string(),
        }
    }
}

/// Metadata carried by every object instance.
///
/// `uid`, `resource_version`, `generation` and `creation_timestamp` are
/// system-owned: the registry stamps them inside its transactions and rejects
/// or overwrites client-supplied values.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    /// Bumped by the registry exactly when a write changed the spec.
    #[serde(default)]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// Uniform metadata access without runtime type inspection.
pub trait ResourceMeta {
    fn type_meta(&self) -> &TypeMeta;
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// The `"<namespace>/<name>"` key this object is stored and queued under.
    fn key(&self) -> String {
        object_key(&self.meta().namespace, &self.meta().name)
    }
}

/// Builds the canonical `"<namespace>/<name>"` key.
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Splits a key back into `(namespace, name)`; `None` if malformed.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    let (ns, name) = key.split_once('/')?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some((ns, name))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Standard mechanism for reporting facets of an object's state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: ConditionStatus,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    pub fn new(r#type: &str, status: ConditionStatus, reason: &str, message: &str) -> Self {
        Self {
            r#type: r#type.to_string(),
            status,
            last_transition_time: Utc::now(),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }
}

/// Upserts `cond` by type. The transition time of an existing condition is
/// kept when its status did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut cond: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == cond.r#type) {
        if existing.status == cond.status {
            cond.last_transition_time = existing.last_transition_time;
        }
        *existing = cond;
    } else {
        conditions.push(cond);
    }
}
