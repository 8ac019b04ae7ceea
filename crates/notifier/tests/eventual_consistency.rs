//! Resync must repair arbitrarily stale caches: after one pass, the emitted
//! callbacks are enough to rebuild an equivalent cache from empty.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use caravel_core::{ResourceMeta, Service, Strategy};
use caravel_notifier::{Notifier, ServiceEventHandler};
use caravel_registry::Registry;
use caravel_store::Store;
use rustc_hash::FxHashMap;

fn registry() -> Arc<Registry> {
    let dir = std::env::temp_dir();
    let f = format!(
        "caravel-consistency-test-{}.redb",
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
        node_pool: Vec::new(),
    };
    svc.spec.template.image = "nginx@1.25".to_string();
    svc
}

/// Replays callbacks into a shadow cache, counting deliveries per key.
#[derive(Default)]
struct Replayer {
    shadow: Mutex<FxHashMap<String, String>>,
    updates_per_key: Mutex<FxHashMap<String, usize>>,
}

impl ServiceEventHandler for Replayer {
    fn on_add(&self, obj: &Service) {
        self.shadow
            .lock()
            .unwrap()
            .insert(obj.key(), obj.metadata.resource_version.clone());
    }

    fn on_update(&self, _old: &Service, new: &Service) {
        self.shadow
            .lock()
            .unwrap()
            .insert(new.key(), new.metadata.resource_version.clone());
        *self
            .updates_per_key
            .lock()
            .unwrap()
            .entry(new.key())
            .or_insert(0) += 1;
    }

    fn on_delete(&self, obj: &Service) {
        self.shadow.lock().unwrap().remove(&obj.key());
    }
}

#[test]
fn one_resync_repairs_an_outage() {
    let reg = registry();
    let notifier = Notifier::new(reg.clone(), Duration::from_secs(3600));

    // Notifier saw the initial state.
    let mut stored = Vec::new();
    for i in 0..5 {
        stored.push(reg.create(sample(&format!("svc-{}", i), 1)).unwrap());
    }
    notifier.resync();

    let replayer = Arc::new(Replayer::default());
    notifier.add_handler(replayer.clone());

    // Outage: ten spec bumps land while the event consumer is down. Each key
    // is touched twice, so intermediate versions are never observed.
    for round in 0..2 {
        for svc in stored.iter_mut() {
            let mut edit = reg
                .get(&svc.metadata.namespace, &svc.metadata.name)
                .unwrap();
            edit.spec.strategy = Strategy::Dynamic {
                replicas: 2 + round,
                node_pool: Vec::new(),
            };
            *svc = reg.update(edit).unwrap();
        }
    }

    // One resync pass repairs everything.
    notifier.resync();

    let (services, _) = reg.list("").unwrap();
    let shadow = replayer.shadow.lock().unwrap().clone();
    assert_eq!(shadow.len(), services.len());
    for svc in &services {
        assert_eq!(
            shadow.get(&svc.key()).unwrap(),
            &svc.metadata.resource_version,
            "shadow cache must hold the latest stored version"
        );
    }

    // Exactly one on_update per drifted key, despite two missed transitions.
    let updates = replayer.updates_per_key.lock().unwrap().clone();
    assert_eq!(updates.len(), 5);
    assert!(updates.values().all(|&n| n == 1), "{updates:?}");

    // The notifier's own cache matches the store as well.
    let cache = notifier.cached_versions();
    for svc in &services {
        assert_eq!(
            cache.get(&svc.key()).unwrap(),
            &svc.metadata.resource_version
        );
    }
}
