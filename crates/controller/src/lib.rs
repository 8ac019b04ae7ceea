//! Caravel service controller: converges platform reality with declared
//! service state.
//!
//! The notifier hands keys to a deduping work queue; worker loops pull keys
//! and run the reconcile pass: read desired state from the registry, observed
//! state from the platform, fix the container count, roll drifted containers,
//! then report status back through the registry. The queue guarantees at most
//! one concurrent reconcile per key regardless of worker count.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use caravel_core::{
    meta::set_condition, split_key, Condition, ConditionStatus, Error, ResourceMeta, Service,
    ServiceStatus, Strategy, UpgradePolicy,
};
use caravel_notifier::{Notifier, ServiceEventHandler};
use caravel_platform::{ContainerFilter, ContainerInfo, CreateContainerRequest, PlatformClient};
use caravel_registry::Registry;
use caravel_workqueue::WorkQueue;
use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Retries before a key is dropped from the queue. The next resync
/// re-enqueues it.
pub const MAX_RETRIES: u32 = 15;

const READY_POLL_ATTEMPTS: u32 = 20;
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Notifier handler that only derives the key and enqueues it; all object
/// inspection happens in the reconcile pass against fresh reads.
struct EnqueueHandler {
    queue: Arc<WorkQueue>,
}

impl ServiceEventHandler for EnqueueHandler {
    fn on_add(&self, obj: &Service) {
        self.queue.add(&obj.key());
    }

    fn on_update(&self, _old: &Service, new: &Service) {
        self.queue.add(&new.key());
    }

    fn on_delete(&self, obj: &Service) {
        self.queue.add(&obj.key());
    }
}

pub struct ServiceController {
    registry: Arc<Registry>,
    platform: Arc<dyn PlatformClient>,
    queue: Arc<WorkQueue>,
}

impl ServiceController {
    /// Binds the controller to its collaborators and registers the enqueue
    /// handler on the notifier.
    pub fn new(
        registry: Arc<Registry>,
        platform: Arc<dyn PlatformClient>,
        notifier: &Notifier,
    ) -> Arc<Self> {
        let queue = WorkQueue::new();
        notifier.add_handler(Arc::new(EnqueueHandler {
            queue: Arc::clone(&queue),
        }));
        Arc::new(Self {
            registry,
            platform,
            queue,
        })
    }

    /// Default worker count from `CARAVEL_WORKERS`, default 2.
    pub fn default_worker_count() -> usize {
        std::env::var("CARAVEL_WORKERS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(2)
            .max(1)
    }

    /// Runs `workers` worker loops until `stop` fires. Shutdown releases
    /// blocked queue reads; in-flight reconciles finish their pass.
    pub async fn run(self: Arc<Self>, workers: usize, stop: watch::Receiver<bool>) {
        info!(workers, "service controller starting");

        let stopper = {
            let queue = Arc::clone(&self.queue);
            let mut stop = stop;
            tokio::spawn(async move {
                let _ = stop.changed().await;
                queue.shut_down();
            })
        };

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let this = Arc::clone(&self);
            handles.push(tokio::spawn(async move { this.worker_loop(worker).await }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        let _ = stopper.await;
        info!("service controller stopped");
    }

    async fn worker_loop(&self, worker: usize) {
        while self.process_next().await {}
        debug!(worker, "worker exiting");
    }

    async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.reconcile(&key)).catch_unwind().await;
        histogram!(
            "reconcile_latency_ms",
            started.elapsed().as_secs_f64() * 1000.0
        );
        match outcome {
            Ok(result) => self.handle_result(&key, result),
            Err(_) => {
                counter!("reconcile_panics_total", 1u64);
                warn!(key = %key, "reconcile panicked; requeueing with backoff");
                self.queue.add_rate_limited(&key);
            }
        }
        self.queue.done(&key);
        true
    }

    fn handle_result(&self, key: &str, result: Result<(), Error>) {
        match result {
            Ok(()) => self.queue.forget(key),
            Err(e) if e.is_retryable() => {
                if self.queue.num_requeues(key) < MAX_RETRIES {
                    debug!(key = %key, error = %e, "reconcile failed; retrying");
                    self.queue.add_rate_limited(key);
                } else {
                    counter!("reconcile_dropped_total", 1u64);
                    warn!(key = %key, error = %e, "retry budget exhausted; dropping key");
                    self.queue.forget(key);
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "terminal reconcile error; not retrying");
                self.queue.forget(key);
            }
        }
    }

    /// One reconcile pass for `key`. Safe to call repeatedly: with unchanged
    /// desired and observed state the pass issues no platform mutations and
    /// no status write.
    pub async fn reconcile(&self, key: &str) -> Result<(), Error> {
        debug!(key = %key, "reconciling service");
        let Some((namespace, name)) = split_key(key) else {
            warn!(key = %key, "malformed key; dropping");
            return Ok(());
        };

        let desired = match self.registry.get(namespace, name) {
            Ok(svc) => svc,
            Err(e) if e.is_not_found() => {
                // Deleted; the notifier already emitted on_delete and cleaned
                // its cache.
                debug!(key = %key, "service no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let filter = owner_filter(&desired);
        let observed = self.platform.list_containers(&filter).await?;
        let intended = desired.spec.intended_replicas();

        if let Err(e) = self.converge(&desired, &observed, intended).await {
            if !e.is_retryable() {
                self.record_degraded(&desired, &e);
            }
            return Err(e);
        }

        let settled = self.platform.list_containers(&filter).await?;
        let new_status = calculate_status(&desired, &settled);
        if new_status != desired.status {
            let mut report = desired.clone();
            report.status = new_status;
            match self.registry.update_status(&report) {
                Ok(_) => {}
                // The object moved on; its change event re-enqueues this key.
                Err(e) if e.is_conflict() || e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        debug!(key = %key, "reconcile complete");
        Ok(())
    }

    async fn converge(
        &self,
        desired: &Service,
        observed: &[ContainerInfo],
        intended: usize,
    ) -> Result<(), Error> {
        let delta = intended as i64 - observed.len() as i64;
        if delta > 0 {
            self.scale_up(desired, observed, delta as usize).await
        } else if delta < 0 {
            self.scale_down(desired, observed, (-delta) as usize).await
        } else {
            self.roll_drifted(desired, observed).await
        }
    }

    async fn scale_up(
        &self,
        desired: &Service,
        observed: &[ContainerInfo],
        count: usize,
    ) -> Result<(), Error> {
        let nodes = self.placement_nodes(desired, observed, count).await?;
        info!(key = %desired.key(), count = nodes.len(), "scaling up");
        for node_id in &nodes {
            let req = container_request(desired, node_id);
            let id = self.platform.create_container(&req).await?;
            debug!(id = %id, node = %node_id, "container created");
            counter!("controller_containers_created_total", 1u64);
        }
        Ok(())
    }

    async fn scale_down(
        &self,
        desired: &Service,
        observed: &[ContainerInfo],
        count: usize,
    ) -> Result<(), Error> {
        let victims = pick_victims(observed, count);
        info!(key = %desired.key(), count = victims.len(), "scaling down");
        for victim in victims {
            self.platform.delete_container(&victim.id).await?;
            debug!(id = %victim.id, "container deleted");
            counter!("controller_containers_deleted_total", 1u64);
        }
        Ok(())
    }

    /// Rolling replacement of containers that drifted from the template.
    /// Replacements come up in batches of at most `maxSurge`, so the total
    /// never exceeds intended+surge. Per batch, up to `maxUnavailable` old
    /// containers are deleted before their replacements report ready; the
    /// rest wait for batch readiness, keeping the ready count at or above
    /// intended minus the configured budget.
    async fn roll_drifted(
        &self,
        desired: &Service,
        observed: &[ContainerInfo],
    ) -> Result<(), Error> {
        let drifted: Vec<&ContainerInfo> = observed
            .iter()
            .filter(|c| is_drifted(desired, c))
            .collect();
        if drifted.is_empty() {
            return Ok(());
        }
        let surge = desired.spec.max_surge().max(1) as usize;
        let unavailable_budget = desired.spec.max_unavailable().max(0) as usize;
        info!(
            key = %desired.key(),
            count = drifted.len(),
            surge,
            unavailable = unavailable_budget,
            "rolling drifted containers"
        );
        for batch in drifted.chunks(surge) {
            let mut replacements = Vec::with_capacity(batch.len());
            for old in batch {
                let req = container_request(desired, &old.node_id);
                replacements.push(self.platform.create_container(&req).await?);
            }
            let early = batch.len().min(unavailable_budget);
            for old in &batch[..early] {
                self.platform.delete_container(&old.id).await?;
                counter!("controller_containers_rolled_total", 1u64);
            }
            for id in &replacements {
                self.wait_ready(id, desired).await?;
            }
            for old in &batch[early..] {
                self.platform.delete_container(&old.id).await?;
                counter!("controller_containers_rolled_total", 1u64);
            }
        }
        Ok(())
    }

    async fn wait_ready(&self, id: &str, desired: &Service) -> Result<(), Error> {
        for attempt in 0..READY_POLL_ATTEMPTS {
            let container = self.platform.get_container(id).await?;
            if container_ready(&container, desired) {
                return Ok(());
            }
            debug!(id = %id, attempt, state = %container.state, "waiting for replacement");
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        Err(Error::Transport(format!(
            "replacement container {} not ready in time",
            id
        )))
    }

    async fn placement_nodes(
        &self,
        desired: &Service,
        observed: &[ContainerInfo],
        count: usize,
    ) -> Result<Vec<String>, Error> {
        match &desired.spec.strategy {
            Strategy::Static { nodes } => {
                // One container per listed node; fill the unoccupied ones.
                let occupied: HashSet<&str> =
                    observed.iter().map(|c| c.node_id.as_str()).collect();
                Ok(nodes
                    .iter()
                    .filter(|n| !occupied.contains(n.as_str()))
                    .take(count)
                    .cloned()
                    .collect())
            }
            Strategy::Dynamic { node_pool, .. } => {
                let pool: Vec<String> = if node_pool.is_empty() {
                    self.platform
                        .get_nodes()
                        .await?
                        .into_iter()
                        .filter(|n| n.is_online())
                        .map(|n| n.id)
                        .collect()
                } else {
                    node_pool.clone()
                };
                if pool.is_empty() {
                    return Err(Error::Transport(
                        "no schedulable nodes available".to_string(),
                    ));
                }
                let start = observed.len();
                Ok((0..count)
                    .map(|i| pool[(start + i) % pool.len()].clone())
                    .collect())
            }
        }
    }

    /// Best-effort status write marking the service degraded after a terminal
    /// error; the next successful pass clears it.
    fn record_degraded(&self, desired: &Service, err: &Error) {
        let mut report = desired.clone();
        set_condition(
            &mut report.status.conditions,
            Condition::new(
                "Degraded",
                ConditionStatus::True,
                "ReconcileFailed",
                &err.to_string(),
            ),
        );
        if let Err(e) = self.registry.update_status(&report) {
            warn!(key = %desired.key(), error = %e, "failed to record degraded condition");
        }
    }
}

/// Containers belong to a service through its uid; a platform-assigned
/// service id learned earlier is included as a fallback.
fn owner_filter(desired: &Service) -> ContainerFilter {
    let mut service_ids = vec![desired.metadata.uid.clone()];
    let platform_id = &desired.status.platform_service_id;
    if !platform_id.is_empty() && platform_id != &desired.metadata.uid {
        service_ids.push(platform_id.clone());
    }
    ContainerFilter {
        service_ids,
        node_ids: Vec::new(),
    }
}

fn container_request(desired: &Service, node_id: &str) -> CreateContainerRequest {
    let mut template = desired.spec.template.clone();
    if template.hostname.is_empty() {
        template.hostname = desired.metadata.name.clone();
    }
    let suffix = Uuid::new_v4().simple().to_string();
    CreateContainerRequest {
        name: format!("{}-{}", desired.metadata.name, &suffix[..8]),
        node_id: node_id.to_string(),
        service_id: desired.metadata.uid.clone(),
        template,
    }
}

/// Victim order for scale-down: non-running containers first, then oldest.
fn pick_victims(observed: &[ContainerInfo], count: usize) -> Vec<&ContainerInfo> {
    let mut candidates: Vec<&ContainerInfo> = observed.iter().collect();
    candidates.sort_by_key(|c| {
        (
            c.is_running(),
            c.created.map(|t| t.timestamp()).unwrap_or(i64::MIN),
        )
    });
    candidates.into_iter().take(count).collect()
}

fn container_ready(container: &ContainerInfo, desired: &Service) -> bool {
    if !container.is_running() {
        return false;
    }
    match desired.spec.template.probe {
        Some(_) => container.healthy.unwrap_or(false),
        None => true,
    }
}

/// Whether `container` should be replaced to match the template. The upgrade
/// policy governs image drift; command, env and resource-limit drift always
/// roll.
fn is_drifted(desired: &Service, container: &ContainerInfo) -> bool {
    let template = &desired.spec.template;
    let image_drift = match desired.spec.upgrade {
        UpgradePolicy::Never => false,
        UpgradePolicy::Always => container.image != template.image,
        UpgradePolicy::Larger => image_version_less(&container.image, &template.image),
    };
    if image_drift {
        return true;
    }
    if !container.command.is_empty() && container.command != template.command {
        return true;
    }
    if !container.env.is_empty() && container.env != template.env {
        return true;
    }
    if let (Some(want), Some(have)) = (&template.resources, &container.resources) {
        if !limits_match(&want.limits, &have.limits) {
            return true;
        }
    }
    false
}

/// Every limit the template declares must be reported by the platform with an
/// equal quantity. Limits the platform adds on its own are ignored.
fn limits_match(template: &BTreeMap<String, String>, observed: &BTreeMap<String, String>) -> bool {
    template.iter().all(|(key, want)| match observed.get(key) {
        Some(have) => quantities_equal(want, have),
        None => false,
    })
}

/// Quantities compare numerically when both sides parse ("128M" equals the
/// platform's byte count), else as plain strings.
fn quantities_equal(a: &str, b: &str) -> bool {
    match (parse_quantity(a), parse_quantity(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Parses "131072", "128M" or "2Gi" into bytes; `None` for unknown forms.
fn parse_quantity(s: &str) -> Option<u64> {
    let s = s.trim();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if digits_end == 0 {
        return None;
    }
    let value: u64 = s[..digits_end].parse().ok()?;
    let multiplier: u64 = match s[digits_end..].trim() {
        "" => 1,
        "K" | "k" | "Ki" => 1 << 10,
        "M" | "m" | "Mi" => 1 << 20,
        "G" | "g" | "Gi" => 1 << 30,
        "T" | "t" | "Ti" => 1 << 40,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

/// True when `current`'s version is below `target`'s. A different image name
/// counts as an upgrade.
fn image_version_less(current: &str, target: &str) -> bool {
    let (current_name, current_version) = current.split_once('@').unwrap_or((current, ""));
    let (target_name, target_version) = target.split_once('@').unwrap_or((target, ""));
    if current_name != target_name {
        return true;
    }
    compare_versions(current_version, target_version) == Ordering::Less
}

/// Dotted-segment comparison; numeric segments compare numerically, the rest
/// lexically.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let left: Vec<&str> = a.split('.').collect();
    let right: Vec<&str> = b.split('.').collect();
    for i in 0..left.len().max(right.len()) {
        let x = left.get(i).copied().unwrap_or("");
        let y = right.get(i).copied().unwrap_or("");
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(xn), Ok(yn)) => xn.cmp(&yn),
            _ => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Aggregates observed containers into the service's status block.
fn calculate_status(desired: &Service, containers: &[ContainerInfo]) -> ServiceStatus {
    let intended = desired.spec.intended_replicas() as i32;
    let replicas = containers.len() as i32;
    let ready = containers
        .iter()
        .filter(|c| container_ready(c, desired))
        .count() as i32;

    let mut status = desired.status.clone();
    status.replicas = replicas;
    status.ready_replicas = ready;
    status.observed_generation = desired.metadata.generation;
    if status.platform_service_id.is_empty() {
        if let Some(c) = containers.iter().find(|c| !c.service_id.is_empty()) {
            status.platform_service_id = c.service_id.clone();
        }
    }

    if replicas == intended && ready == intended {
        set_condition(
            &mut status.conditions,
            Condition::new(
                "Available",
                ConditionStatus::True,
                "AllReplicasReady",
                &format!("{}/{} replicas ready", ready, intended),
            ),
        );
        set_condition(
            &mut status.conditions,
            Condition::new(
                "Progressing",
                ConditionStatus::False,
                "Converged",
                "observed state matches the declared state",
            ),
        );
    } else {
        set_condition(
            &mut status.conditions,
            Condition::new(
                "Available",
                ConditionStatus::False,
                "ReplicasNotReady",
                &format!("{}/{} replicas ready", ready, intended),
            ),
        );
        set_condition(
            &mut status.conditions,
            Condition::new(
                "Progressing",
                ConditionStatus::True,
                "Converging",
                &format!("observed {} containers, want {}", replicas, intended),
            ),
        );
    }
    set_condition(
        &mut status.conditions,
        Condition::new(
            "Degraded",
            ConditionStatus::False,
            "AsExpected",
            "",
        ),
    );
    status
}
