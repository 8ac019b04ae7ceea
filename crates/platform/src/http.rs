//! HTTP implementation of the platform capability set.
//!
//! Every response arrives in the platform's JSON envelope
//! `{status, message, data, fieldErrors}`; a non-200 envelope status is a
//! terminal platform error. HTTP transport faults and 5xx/429 map to the
//! transient `Transport` kind so controllers retry them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use caravel_core::{Error, ResourceLimits};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::types::{
    ContainerAction, ContainerFilter, ContainerInfo, CreateContainerRequest, NodeInfo,
    PlatformServiceInfo, PlatformTransaction, ServiceFilter,
};
use crate::PlatformClient;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct Envelope {
    status: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default, rename = "fieldErrors")]
    field_errors: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default)]
    total: usize,
    #[serde(default = "Vec::new", rename = "list")]
    items: Vec<T>,
}

pub struct HttpPlatformClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPlatformClient {
    pub fn new(base_url: &str) -> Result<Self, Error> {
        let timeout = std::env::var("CARAVEL_PLATFORM_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout))
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, Error> {
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() || e.is_request() {
                Error::Transport(e.to_string())
            } else {
                Error::Internal(e.to_string())
            }
        })?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound("platform object not found".to_string()));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::Transport(format!("platform returned {}", status)));
        }
        if !status.is_success() {
            return Err(Error::Platform(format!("platform returned {}", status)));
        }

        let envelope: Envelope = resp
            .json()
            .await
            .map_err(|e| Error::Transport(format!("decoding response: {}", e)))?;
        if envelope.status != 200 {
            let mut msg = envelope
                .message
                .unwrap_or_else(|| "unspecified platform error".to_string());
            if let Some(fields) = envelope.field_errors {
                msg = format!("{} (fields: {})", msg, fields);
            }
            return Err(Error::Platform(format!(
                "status {}: {}",
                envelope.status, msg
            )));
        }
        let data = envelope.data.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(data).map_err(|e| Error::Internal(format!("decoding data: {}", e)))
    }

    /// Walks a paginated listing endpoint until all pages are collected.
    async fn list_paged<T: DeserializeOwned>(
        &self,
        path: &str,
        base_query: &[(String, String)],
    ) -> Result<Vec<T>, Error> {
        let mut items = Vec::new();
        let mut page_num = 1usize;
        loop {
            let mut query: Vec<(String, String)> = base_query.to_vec();
            query.push(("pageNum".to_string(), page_num.to_string()));
            query.push(("pageSize".to_string(), PAGE_SIZE.to_string()));
            let page: Page<T> = self
                .execute(self.client.get(self.url(path)).query(&query))
                .await?;
            let fetched = page.items.len();
            items.extend(page.items);
            if fetched < PAGE_SIZE || items.len() >= page.total {
                return Ok(items);
            }
            page_num += 1;
        }
    }
}

/// Some platform builds report only raw byte limits; fold them into the
/// structured resources block.
fn normalize_container(mut container: ContainerInfo) -> ContainerInfo {
    if container.resources.is_none() {
        let mut limits = BTreeMap::new();
        if container.memory_limit > 0 {
            limits.insert("memory".to_string(), container.memory_limit.to_string());
        }
        if container.size_limit > 0 {
            limits.insert("disk".to_string(), container.size_limit.to_string());
        }
        if !limits.is_empty() {
            container.resources = Some(ResourceLimits { limits });
        }
    }
    container
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerInfo>, Error> {
        let mut query = Vec::new();
        for id in &filter.service_ids {
            query.push(("serviceIds[]".to_string(), id.clone()));
        }
        for id in &filter.node_ids {
            query.push(("nodeIds[]".to_string(), id.clone()));
        }
        let path = if filter.node_ids.is_empty() {
            "/container/service"
        } else {
            "/container/node"
        };
        let containers: Vec<ContainerInfo> = self.list_paged(path, &query).await?;
        Ok(containers.into_iter().map(normalize_container).collect())
    }

    async fn create_container(&self, req: &CreateContainerRequest) -> Result<String, Error> {
        debug!(name = %req.name, node = %req.node_id, "creating container");
        #[derive(Debug, Deserialize)]
        struct Created {
            id: String,
        }
        let created: Created = self
            .execute(self.client.post(self.url("/container")).json(req))
            .await?;
        Ok(created.id)
    }

    async fn delete_container(&self, id: &str) -> Result<(), Error> {
        debug!(id = %id, "deleting container");
        let res: Result<serde_json::Value, Error> = self
            .execute(self.client.delete(self.url(&format!("/container/{}", id))))
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_container(&self, id: &str) -> Result<ContainerInfo, Error> {
        let container: ContainerInfo = self
            .execute(self.client.get(self.url(&format!("/container/{}", id))))
            .await?;
        Ok(normalize_container(container))
    }

    async fn list_services(
        &self,
        filter: &ServiceFilter,
    ) -> Result<Vec<PlatformServiceInfo>, Error> {
        let mut query = Vec::new();
        if let Some(name) = &filter.name {
            query.push(("name".to_string(), name.clone()));
        }
        self.list_paged("/service", &query).await
    }

    async fn get_nodes(&self) -> Result<Vec<NodeInfo>, Error> {
        self.list_paged("/node/list", &[]).await
    }

    async fn submit_container_action(
        &self,
        id: &str,
        action: ContainerAction,
    ) -> Result<PlatformTransaction, Error> {
        debug!(id = %id, action = %action, "submitting container action");
        self.execute(
            self.client
                .post(self.url("/container/control"))
                .json(&json!({ "id": id, "action": action })),
        )
        .await
    }
}
