//! End-to-end reconcile scenarios against a real registry on a temp database
//! and the in-memory platform.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use caravel_controller::ServiceController;
use caravel_core::{ConditionStatus, ResourceLimits, Service, Strategy, UpgradePolicy};
use caravel_notifier::Notifier;
use caravel_platform::{FakePlatform, PlatformClient};
use caravel_registry::Registry;
use caravel_store::Store;
use tokio::sync::watch;

fn registry() -> Arc<Registry> {
    let dir = std::env::temp_dir();
    let f = format!(
        "caravel-controller-test-{}.redb",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    );
    Registry::new(Arc::new(Store::open(dir.join(f)).unwrap())).unwrap()
}

fn sample(name: &str, replicas: i32) -> Service {
    let mut svc = Service::default();
    svc.metadata.name = name.to_string();
    svc.metadata.namespace = "default".to_string();
    svc.spec.strategy = Strategy::Dynamic {
        replicas,
        node_pool: vec!["node-1".to_string(), "node-2".to_string()],
    };
    svc.spec.template.image = "nginx@1.25".to_string();
    svc
}

struct Harness {
    registry: Arc<Registry>,
    platform: Arc<FakePlatform>,
    controller: Arc<ServiceController>,
    notifier: Arc<Notifier>,
}

fn harness() -> Harness {
    let registry = registry();
    let platform = Arc::new(FakePlatform::new());
    let notifier = Notifier::new(Arc::clone(&registry), Duration::from_secs(3600));
    let controller = ServiceController::new(
        Arc::clone(&registry),
        platform.clone() as Arc<dyn PlatformClient>,
        &notifier,
    );
    Harness {
        registry,
        platform,
        controller,
        notifier,
    }
}

#[tokio::test]
async fn create_scales_up_to_declared_replicas() {
    let h = harness();
    let stored = h.registry.create(sample("web", 3)).unwrap();
    assert_eq!(stored.metadata.resource_version, "1");
    assert!(!stored.metadata.uid.is_empty());

    h.controller.reconcile("default/web").await.unwrap();

    let containers = h.platform.containers();
    assert_eq!(containers.len(), 3);
    assert!(containers.iter().all(|c| c.service_id == stored.metadata.uid));
    assert!(containers.iter().all(|c| c.image == "nginx@1.25"));

    let reported = h.registry.get("default", "web").unwrap();
    assert_eq!(reported.status.replicas, 3);
    assert_eq!(reported.status.ready_replicas, 3);
    assert_eq!(reported.status.observed_generation, 1);
    let available = reported
        .status
        .conditions
        .iter()
        .find(|c| c.r#type == "Available")
        .unwrap();
    assert_eq!(available.status, ConditionStatus::True);
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let h = harness();
    h.registry.create(sample("web", 2)).unwrap();

    h.controller.reconcile("default/web").await.unwrap();
    let creates = h.platform.create_calls();
    let (_, rv_after_first) = h.registry.list("").unwrap();

    // Same desired and observed state: no new side effects, no status write.
    h.controller.reconcile("default/web").await.unwrap();
    assert_eq!(h.platform.create_calls(), creates);
    assert_eq!(h.platform.delete_calls(), 0);
    let (_, rv_after_second) = h.registry.list("").unwrap();
    assert_eq!(rv_after_first, rv_after_second);
}

#[tokio::test]
async fn shrinking_replicas_deletes_surplus_containers() {
    let h = harness();
    h.registry.create(sample("web", 3)).unwrap();
    h.controller.reconcile("default/web").await.unwrap();
    assert_eq!(h.platform.containers().len(), 3);

    let mut edit = h.registry.get("default", "web").unwrap();
    edit.spec.strategy = Strategy::Dynamic {
        replicas: 1,
        node_pool: vec!["node-1".to_string(), "node-2".to_string()],
    };
    h.registry.update(edit).unwrap();

    h.controller.reconcile("default/web").await.unwrap();
    assert_eq!(h.platform.containers().len(), 1);
    let reported = h.registry.get("default", "web").unwrap();
    assert_eq!(reported.status.replicas, 1);
    assert_eq!(reported.status.ready_replicas, 1);
}

#[tokio::test]
async fn scale_down_victims_are_non_running_first() {
    let h = harness();
    h.registry.create(sample("web", 3)).unwrap();
    h.controller.reconcile("default/web").await.unwrap();

    let stopped_id = h.platform.containers()[0].id.clone();
    h.platform.set_container_state(&stopped_id, "stopped");

    let mut edit = h.registry.get("default", "web").unwrap();
    edit.spec.strategy = Strategy::Dynamic {
        replicas: 2,
        node_pool: vec!["node-1".to_string()],
    };
    h.registry.update(edit).unwrap();

    h.controller.reconcile("default/web").await.unwrap();
    let remaining = h.platform.containers();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|c| c.id != stopped_id));
}

#[tokio::test]
async fn static_strategy_places_one_container_per_node() {
    let h = harness();
    let mut svc = sample("edge", 0);
    svc.spec.strategy = Strategy::Static {
        nodes: vec!["node-a".to_string(), "node-b".to_string()],
    };
    h.registry.create(svc).unwrap();

    h.controller.reconcile("default/edge").await.unwrap();
    let containers = h.platform.containers();
    assert_eq!(containers.len(), 2);
    let mut nodes: Vec<&str> = containers.iter().map(|c| c.node_id.as_str()).collect();
    nodes.sort();
    assert_eq!(nodes, vec!["node-a", "node-b"]);

    // A second pass fills nothing and creates nothing.
    let creates = h.platform.create_calls();
    h.controller.reconcile("default/edge").await.unwrap();
    assert_eq!(h.platform.create_calls(), creates);
}

#[tokio::test]
async fn empty_node_pool_round_robins_platform_nodes() {
    let registry = registry();
    let platform = Arc::new(FakePlatform::with_nodes(&["alpha", "beta"]));
    let notifier = Notifier::new(Arc::clone(&registry), Duration::from_secs(3600));
    let controller = ServiceController::new(
        Arc::clone(&registry),
        platform.clone() as Arc<dyn PlatformClient>,
        &notifier,
    );

    let mut svc = sample("web", 4);
    svc.spec.strategy = Strategy::Dynamic {
        replicas: 4,
        node_pool: Vec::new(),
    };
    registry.create(svc).unwrap();

    controller.reconcile("default/web").await.unwrap();
    let containers = platform.containers();
    assert_eq!(containers.len(), 4);
    let on_first = containers.iter().filter(|c| c.node_id == "node-1").count();
    let on_second = containers.iter().filter(|c| c.node_id == "node-2").count();
    assert_eq!((on_first, on_second), (2, 2), "round-robin over platform nodes");
}

#[tokio::test]
async fn deleted_service_reconciles_to_success() {
    let h = harness();
    h.registry.create(sample("web", 1)).unwrap();
    h.registry.delete("default", "web").unwrap();
    h.controller.reconcile("default/web").await.unwrap();
    assert_eq!(h.platform.create_calls(), 0);
}

#[tokio::test]
async fn image_bump_rolls_containers_one_by_one() {
    let h = harness();
    let mut svc = sample("web", 2);
    svc.spec.upgrade = UpgradePolicy::Always;
    h.registry.create(svc).unwrap();
    h.controller.reconcile("default/web").await.unwrap();
    assert_eq!(h.platform.containers().len(), 2);

    let mut edit = h.registry.get("default", "web").unwrap();
    edit.spec.template.image = "nginx@1.26".to_string();
    h.registry.update(edit).unwrap();

    h.controller.reconcile("default/web").await.unwrap();
    let containers = h.platform.containers();
    assert_eq!(containers.len(), 2);
    assert!(containers.iter().all(|c| c.image == "nginx@1.26"));
    // Each drifted container was replaced, not mutated in place.
    assert_eq!(h.platform.create_calls(), 4);
    assert_eq!(h.platform.delete_calls(), 2);

    let reported = h.registry.get("default", "web").unwrap();
    assert_eq!(reported.status.observed_generation, 2);
    assert_eq!(reported.status.ready_replicas, 2);
}

#[tokio::test]
async fn unavailable_budget_deletes_old_before_replacement_readiness() {
    let h = harness();
    let mut svc = sample("web", 1);
    svc.spec.upgrade = UpgradePolicy::Always;
    svc.spec.max_unavailable = Some(1);
    h.registry.create(svc).unwrap();
    h.controller.reconcile("default/web").await.unwrap();
    let old_id = h.platform.containers()[0].id.clone();

    let mut edit = h.registry.get("default", "web").unwrap();
    edit.spec.template.image = "nginx@1.26".to_string();
    h.registry.update(edit).unwrap();
    h.controller.reconcile("default/web").await.unwrap();

    // The unavailability budget lets the drifted container go away before the
    // replacement's first readiness poll.
    let ops = h.platform.operations();
    let delete_pos = ops
        .iter()
        .position(|op| op == &format!("delete:{}", old_id))
        .unwrap();
    let first_poll = ops.iter().position(|op| op.starts_with("get:")).unwrap();
    assert!(delete_pos < first_poll, "{ops:?}");

    let containers = h.platform.containers();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].image, "nginx@1.26");
}

#[tokio::test]
async fn zero_unavailable_budget_waits_for_readiness_before_deleting() {
    let h = harness();
    let mut svc = sample("web", 1);
    svc.spec.upgrade = UpgradePolicy::Always;
    h.registry.create(svc).unwrap();
    h.controller.reconcile("default/web").await.unwrap();
    let old_id = h.platform.containers()[0].id.clone();

    let mut edit = h.registry.get("default", "web").unwrap();
    edit.spec.template.image = "nginx@1.26".to_string();
    h.registry.update(edit).unwrap();
    h.controller.reconcile("default/web").await.unwrap();

    // Default maxUnavailable is 0: the old container outlives the readiness
    // poll of its replacement.
    let ops = h.platform.operations();
    let delete_pos = ops
        .iter()
        .position(|op| op == &format!("delete:{}", old_id))
        .unwrap();
    let first_poll = ops.iter().position(|op| op.starts_with("get:")).unwrap();
    assert!(first_poll < delete_pos, "{ops:?}");
}

#[tokio::test]
async fn resource_limit_edits_roll_containers() {
    let h = harness();
    let mut svc = sample("web", 1);
    svc.spec.template.resources = Some(ResourceLimits {
        limits: BTreeMap::from([("memory".to_string(), "128M".to_string())]),
    });
    h.registry.create(svc).unwrap();
    h.controller.reconcile("default/web").await.unwrap();
    assert_eq!(h.platform.delete_calls(), 0);

    let mut edit = h.registry.get("default", "web").unwrap();
    edit.spec.template.resources = Some(ResourceLimits {
        limits: BTreeMap::from([("memory".to_string(), "256M".to_string())]),
    });
    h.registry.update(edit).unwrap();

    // Image and policy are untouched; the limit change alone must roll.
    h.controller.reconcile("default/web").await.unwrap();
    let containers = h.platform.containers();
    assert_eq!(containers.len(), 1);
    assert_eq!(
        containers[0]
            .resources
            .as_ref()
            .unwrap()
            .limits
            .get("memory")
            .unwrap(),
        "256M"
    );
    assert_eq!(h.platform.delete_calls(), 1);
}

#[tokio::test]
async fn never_policy_leaves_drifted_containers_alone() {
    let h = harness();
    h.registry.create(sample("web", 1)).unwrap();
    h.controller.reconcile("default/web").await.unwrap();

    let mut edit = h.registry.get("default", "web").unwrap();
    edit.spec.template.image = "nginx@1.30".to_string();
    h.registry.update(edit).unwrap();

    h.controller.reconcile("default/web").await.unwrap();
    let containers = h.platform.containers();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].image, "nginx@1.25");
}

#[tokio::test]
async fn transient_create_failures_retry_until_success() {
    let h = harness();
    h.platform.fail_next_creates(3);

    let (stop_tx, stop_rx) = watch::channel(false);
    let notifier_task = tokio::spawn(h.notifier.clone().run(stop_rx.clone()));
    let controller_task = tokio::spawn(h.controller.clone().run(1, stop_rx));

    h.registry.create(sample("web", 1)).unwrap();

    // Backoff schedule is 5ms/10ms/20ms; the fourth attempt lands quickly.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if h.platform.containers().len() == 1 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "containers never converged; {} create calls",
            h.platform.create_calls()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.platform.create_calls(), 4);

    // Wait for the successful pass to report status.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let reported = h.registry.get("default", "web").unwrap();
        if reported.status.ready_replicas == 1 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "status never reported");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    stop_tx.send(true).unwrap();
    controller_task.await.unwrap();
    notifier_task.await.unwrap();
}
