//! Caravel core types: the declarative object model shared by every layer.

#![forbid(unsafe_code)]

pub mod error;
pub mod meta;
pub mod service;

pub use error::Error;
pub use meta::{
    object_key, split_key, Condition, ConditionStatus, ObjectMeta, ResourceMeta, TypeMeta,
    API_VERSION,
};
pub use service::{
    ContainerTemplate, EnvVar, HealthProbe, ImagePullPolicy, LaunchMode, PlatformOverrides,
    ResourceLimits, Service, ServiceSpec, ServiceStatus, Strategy, UpgradePolicy, VolumeMount,
    SERVICE_KIND,
};

pub mod prelude {
    pub use super::{object_key, split_key, Error, ResourceMeta, Service};
}
