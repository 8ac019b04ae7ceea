//! In-memory platform for controller tests: scripted failures, call
//! accounting, and instant container lifecycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use caravel_core::Error;
use chrono::Utc;
use rustc_hash::FxHashMap;

use crate::types::{
    ContainerAction, ContainerFilter, ContainerInfo, CreateContainerRequest, NodeInfo,
    PlatformServiceInfo, PlatformTransaction, ServiceFilter, STATE_RUNNING,
};
use crate::PlatformClient;

#[derive(Default)]
struct FakeState {
    containers: FxHashMap<String, ContainerInfo>,
    nodes: Vec<NodeInfo>,
    /// Fail the next N create calls with a transport error.
    create_failures: u32,
    /// State assigned to newly created containers.
    new_container_state: Option<String>,
}

/// Test double for the platform. All operations succeed instantly unless a
/// failure is scripted.
pub struct FakePlatform {
    state: Mutex<FakeState>,
    next_id: AtomicU64,
    create_calls: AtomicU64,
    delete_calls: AtomicU64,
    operations: Mutex<Vec<String>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            next_id: AtomicU64::new(1),
            create_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
            operations: Mutex::new(Vec::new()),
        }
    }

    pub fn with_nodes(nodes: &[&str]) -> Self {
        let fake = Self::new();
        fake.state.lock().unwrap().nodes = nodes
            .iter()
            .enumerate()
            .map(|(i, name)| NodeInfo {
                id: format!("node-{}", i + 1),
                name: name.to_string(),
                address: format!("10.0.0.{}", i + 1),
                status: "online".to_string(),
            })
            .collect();
        fake
    }

    /// Scripts the next `n` create calls to fail with `Transport`.
    pub fn fail_next_creates(&self, n: u32) {
        self.state.lock().unwrap().create_failures = n;
    }

    /// Newly created containers come up in `state` instead of `running`.
    pub fn set_new_container_state(&self, state: &str) {
        self.state.lock().unwrap().new_container_state = Some(state.to_string());
    }

    /// Flips an existing container's state.
    pub fn set_container_state(&self, id: &str, state: &str) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(id) {
            c.state = state.to_string();
        }
    }

    pub fn containers(&self) -> Vec<ContainerInfo> {
        let mut out: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .containers
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::Relaxed)
    }

    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::Relaxed)
    }

    /// Mutating and readiness-poll calls in arrival order, e.g.
    /// `["create:c-1", "delete:c-1", "get:c-2"]`.
    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().unwrap().clone()
    }

    fn record(&self, op: String) {
        self.operations.lock().unwrap().push(op);
    }
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerInfo>, Error> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<_> = state
            .containers
            .values()
            .filter(|c| {
                (filter.service_ids.is_empty() || filter.service_ids.contains(&c.service_id))
                    && (filter.node_ids.is_empty() || filter.node_ids.contains(&c.node_id))
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn create_container(&self, req: &CreateContainerRequest) -> Result<String, Error> {
        self.create_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        if state.create_failures > 0 {
            state.create_failures -= 1;
            return Err(Error::Transport("injected create failure".to_string()));
        }
        let id = format!("c-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let container_state = state
            .new_container_state
            .clone()
            .unwrap_or_else(|| STATE_RUNNING.to_string());
        state.containers.insert(
            id.clone(),
            ContainerInfo {
                id: id.clone(),
                name: req.name.clone(),
                state: container_state,
                healthy: None,
                image: req.template.image.clone(),
                command: req.template.command.clone(),
                env: req.template.env.clone(),
                resources: req.template.resources.clone(),
                memory_limit: 0,
                size_limit: 0,
                service_id: req.service_id.clone(),
                node_id: req.node_id.clone(),
                node_name: String::new(),
                created: Some(Utc::now()),
                failed_message: None,
                restart_count: 0,
            },
        );
        drop(state);
        self.record(format!("create:{}", id));
        Ok(id)
    }

    async fn delete_container(&self, id: &str) -> Result<(), Error> {
        self.delete_calls.fetch_add(1, Ordering::Relaxed);
        self.state.lock().unwrap().containers.remove(id);
        self.record(format!("delete:{}", id));
        Ok(())
    }

    async fn get_container(&self, id: &str) -> Result<ContainerInfo, Error> {
        self.record(format!("get:{}", id));
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn list_services(
        &self,
        _filter: &ServiceFilter,
    ) -> Result<Vec<PlatformServiceInfo>, Error> {
        let state = self.state.lock().unwrap();
        let mut by_service: FxHashMap<String, PlatformServiceInfo> = FxHashMap::default();
        for c in state.containers.values() {
            let entry = by_service
                .entry(c.service_id.clone())
                .or_insert_with(|| PlatformServiceInfo {
                    id: c.service_id.clone(),
                    name: c.name.clone(),
                    container_total: 0,
                    container_running: 0,
                });
            entry.container_total += 1;
            if c.is_running() {
                entry.container_running += 1;
            }
        }
        Ok(by_service.into_values().collect())
    }

    async fn get_nodes(&self) -> Result<Vec<NodeInfo>, Error> {
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn submit_container_action(
        &self,
        id: &str,
        action: ContainerAction,
    ) -> Result<PlatformTransaction, Error> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        container.state = match action {
            ContainerAction::Start | ContainerAction::Restart | ContainerAction::Unpause => {
                STATE_RUNNING.to_string()
            }
            ContainerAction::Stop => "stopped".to_string(),
            ContainerAction::Pause => "paused".to_string(),
        };
        Ok(PlatformTransaction {
            id: format!("txn-{}", id),
            status: "success".to_string(),
            timestamp: Utc::now().timestamp(),
        })
    }
}
