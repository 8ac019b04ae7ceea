//! Caravel platform client: the capability set controllers consume to
//! observe and mutate the container platform.
//!
//! The platform speaks imperative CRUD over HTTP. This crate exposes those
//! capabilities as a trait so controllers stay transport-agnostic, plus the
//! HTTP implementation and an in-memory fake for tests. Cancellation follows
//! tokio semantics: dropping an in-flight call aborts the request; every
//! request additionally carries a client-level timeout.

#![forbid(unsafe_code)]

mod fake;
mod http;
mod types;

use async_trait::async_trait;
use caravel_core::Error;

pub use fake::FakePlatform;
pub use http::HttpPlatformClient;
pub use types::{
    ContainerAction, ContainerFilter, ContainerInfo, CreateContainerRequest, NodeInfo,
    PlatformServiceInfo, PlatformTransaction, ServiceFilter,
};

/// Capability set against the platform. Errors are taxonomised: `Transport`
/// is presumed transient and retried by controllers, `Platform` is terminal,
/// `NotFound` is contextual.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Containers matching the filter, fully paginated.
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerInfo>, Error>;

    /// Creates one container and returns its platform-assigned id.
    async fn create_container(&self, req: &CreateContainerRequest) -> Result<String, Error>;

    /// Idempotent delete; an already-absent container is success.
    async fn delete_container(&self, id: &str) -> Result<(), Error>;

    async fn get_container(&self, id: &str) -> Result<ContainerInfo, Error>;

    /// Platform-side service records matching the filter.
    async fn list_services(&self, filter: &ServiceFilter)
        -> Result<Vec<PlatformServiceInfo>, Error>;

    async fn get_nodes(&self) -> Result<Vec<NodeInfo>, Error>;

    /// Submits an asynchronous lifecycle action; the platform returns a
    /// transaction to poll.
    async fn submit_container_action(
        &self,
        id: &str,
        action: ContainerAction,
    ) -> Result<PlatformTransaction, Error>;
}
