//! The Service kind: a container template plus a deployment strategy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::meta::{Condition, ObjectMeta, ResourceMeta, TypeMeta};

pub const SERVICE_KIND: &str = "Service";

/// A declarative service: desired state in `spec`, controller-reported
/// observations in `status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Service {
    #[serde(flatten)]
    pub type_meta: TypeMeta,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ServiceSpec,
    #[serde(default)]
    pub status: ServiceStatus,
}

impl ResourceMeta for Service {
    fn type_meta(&self) -> &TypeMeta {
        &self.type_meta
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub strategy: Strategy,
    #[serde(default)]
    pub upgrade: UpgradePolicy,
    pub template: ContainerTemplate,
    /// Rolling-update surge bound; how many extra containers may exist while
    /// replacements are brought up. Defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<i32>,
    /// Rolling-update availability floor; how many intended replicas may be
    /// unready during a replacement. Defaults to 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i32>,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            strategy: Strategy::Dynamic {
                replicas: 1,
                node_pool: Vec::new(),
            },
            upgrade: UpgradePolicy::default(),
            template: ContainerTemplate::default(),
            max_surge: None,
            max_unavailable: None,
        }
    }
}

impl ServiceSpec {
    /// How many containers this spec asks for. `Static` pins one container
    /// per listed node; `Dynamic` is an explicit count.
    pub fn intended_replicas(&self) -> usize {
        match &self.strategy {
            Strategy::Static { nodes } => nodes.len(),
            Strategy::Dynamic { replicas, .. } => (*replicas).max(0) as usize,
        }
    }

    pub fn max_surge(&self) -> i32 {
        self.max_surge.unwrap_or(1)
    }

    pub fn max_unavailable(&self) -> i32 {
        self.max_unavailable.unwrap_or(0)
    }
}

/// Node-placement strategy for a service's containers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Strategy {
    /// One container on each listed node.
    Static {
        #[serde(default)]
        nodes: Vec<String>,
    },
    /// `replicas` containers spread over a node pool; an empty pool delegates
    /// node choice to whatever the platform reports.
    Dynamic {
        #[serde(default = "default_dynamic_replicas")]
        replicas: i32,
        #[serde(default, rename = "nodePool")]
        node_pool: Vec<String>,
    },
}

fn default_dynamic_replicas() -> i32 {
    1
}

/// When the controller replaces running containers whose image drifted from
/// the template.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum UpgradePolicy {
    /// Never replace a running container because of image drift.
    #[default]
    Never,
    /// Replace only when the template's image version is higher.
    Larger,
    /// Replace on any image difference.
    Always,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImagePullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

/// Template for the containers a service creates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerTemplate {
    /// Image reference in `name@tag` form.
    pub image: String,
    #[serde(default)]
    pub image_pull_policy: ImagePullPolicy,
    /// Sync the image to all nodes ahead of deployment.
    #[serde(default)]
    pub prepull: bool,
    /// Container hostname; defaults to the service name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<HealthProbe>,
    /// Escape hatch for platform-specific launch configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_overrides: Option<PlatformOverrides>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Simplified resource model: limits only, keyed by resource name
/// (`memory`, `disk`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Liveness probe evaluated by the platform agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthProbe {
    #[serde(default)]
    pub initial_delay_seconds: i32,
    #[serde(default)]
    pub timeout_seconds: i32,
    #[serde(default)]
    pub period_seconds: i32,
    #[serde(default)]
    pub failure_threshold: i32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum LaunchMode {
    /// Create and start.
    #[default]
    Run,
    /// Create only.
    Load,
}

/// Low-level knobs most users never touch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformOverrides {
    #[serde(default)]
    pub launch_mode: LaunchMode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub root_path: String,
    #[serde(default)]
    pub root_read_only: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arch: String,
}

/// Controller-reported observation of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    /// Containers found on the platform for this service.
    #[serde(default)]
    pub replicas: i32,
    /// Containers running and passing their probe.
    #[serde(default)]
    pub ready_replicas: i32,
    /// The `metadata.generation` most recently acted on.
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Identifier the platform assigned to the underlying service, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub platform_service_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_json_shape_is_tagged() {
        let s = Strategy::Dynamic {
            replicas: 3,
            node_pool: vec!["n1".into()],
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["type"], "Dynamic");
        assert_eq!(v["replicas"], 3);
        assert_eq!(v["nodePool"][0], "n1");

        let back: Strategy = serde_json::from_value(v).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn dynamic_replicas_default_applies() {
        let s: Strategy = serde_json::from_str(r#"{"type":"Dynamic"}"#).unwrap();
        assert_eq!(
            s,
            Strategy::Dynamic {
                replicas: 1,
                node_pool: vec![]
            }
        );
    }

    #[test]
    fn intended_replicas_per_strategy() {
        let mut spec = ServiceSpec::default();
        spec.strategy = Strategy::Static {
            nodes: vec!["a".into(), "b".into()],
        };
        assert_eq!(spec.intended_replicas(), 2);

        spec.strategy = Strategy::Dynamic {
            replicas: 5,
            node_pool: vec![],
        };
        assert_eq!(spec.intended_replicas(), 5);
    }

    #[test]
    fn service_round_trips_through_json() {
        let mut svc = Service::default();
        svc.type_meta = TypeMeta::for_kind(SERVICE_KIND);
        svc.metadata.name = "web".into();
        svc.metadata.namespace = "default".into();
        svc.spec.template.image = "nginx@1.25".into();
        svc.spec.template.env = vec![EnvVar {
            name: "MODE".into(),
            value: "prod".into(),
        }];

        let bytes = serde_json::to_vec(&svc).unwrap();
        let back: Service = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, svc);
        assert_eq!(back.key(), "default/web");
    }
}
