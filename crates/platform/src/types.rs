//! Wire types exchanged with the platform.

use caravel_core::{ContainerTemplate, EnvVar, ResourceLimits};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Container state strings reported by the platform.
pub const STATE_RUNNING: &str = "running";

/// One container as the platform reports it. Trimmed to the fields the
/// controller consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    /// Lifecycle state: `creating`, `running`, `stopped`, `failed`, ...
    pub state: String,
    /// Probe verdict, when a probe is configured for the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy: Option<bool>,
    /// Image reference in `name@tag` form.
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Configured limits as the platform reports them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,
    /// Raw byte limits; folded into `resources` when no structured block is
    /// reported.
    #[serde(default)]
    pub memory_limit: i64,
    #[serde(default)]
    pub size_limit: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_id: String,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_message: Option<String>,
    #[serde(default)]
    pub restart_count: i32,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state == STATE_RUNNING
    }
}

/// Scopes a container listing to a set of services and/or nodes.
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    pub service_ids: Vec<String>,
    pub node_ids: Vec<String>,
}

impl ContainerFilter {
    pub fn by_service(service_id: &str) -> Self {
        Self {
            service_ids: vec![service_id.to_string()],
            node_ids: Vec::new(),
        }
    }
}

/// Everything the platform needs to start one container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateContainerRequest {
    pub name: String,
    pub node_id: String,
    /// Owner marker; containers are listed back by this id.
    pub service_id: String,
    pub template: ContainerTemplate,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceFilter {
    pub name: Option<String>,
}

/// Platform-side service record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformServiceInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub container_total: i32,
    #[serde(default)]
    pub container_running: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    pub address: String,
    /// `online` or `offline`.
    pub status: String,
}

impl NodeInfo {
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }
}

/// Lifecycle actions a container accepts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
    Pause,
    Unpause,
}

impl std::fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerAction::Start => "start",
            ContainerAction::Stop => "stop",
            ContainerAction::Restart => "restart",
            ContainerAction::Pause => "pause",
            ContainerAction::Unpause => "unpause",
        };
        f.write_str(s)
    }
}

/// Handle for an asynchronous platform operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlatformTransaction {
    pub id: String,
    /// `running`, `success` or `failure`.
    pub status: String,
    #[serde(default)]
    pub timestamp: i64,
}
