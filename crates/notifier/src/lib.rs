//! Caravel notifier: fans registry changes out to controllers.
//!
//! Two paths feed the same handler set. The real-time path drains a registry
//! subscription and filters duplicates through a version-vector cache (key →
//! last-seen resourceVersion; full objects are never cached). The resync path
//! periodically relists the registry and derives the deltas needed to repair
//! any events the bounded subscription dropped. Either way, handlers see a
//! stream of add/update/delete callbacks that is eventually consistent with
//! the store.

#![forbid(unsafe_code)]

use std::sync::{Arc, RwLock};
use std::time::Duration;

use caravel_core::{split_key, Service};
use caravel_registry::{Event, EventType, Registry};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Callbacks invoked from the notifier's workers, synchronously and in
/// registration order. Handlers must be fast; slow consumers hand the key off
/// to their own queue.
///
/// Because objects are not cached, `on_update` receives the new object as
/// both arguments; do not diff against `old`.
pub trait ServiceEventHandler: Send + Sync {
    fn on_add(&self, obj: &Service);
    fn on_update(&self, old: &Service, new: &Service);
    fn on_delete(&self, obj: &Service);
}

/// Per-kind notifier instance for the service kind.
pub struct Notifier {
    registry: Arc<Registry>,
    resync_interval: Duration,
    cache: RwLock<FxHashMap<String, String>>,
    handlers: RwLock<Vec<Arc<dyn ServiceEventHandler>>>,
}

impl Notifier {
    pub fn new(registry: Arc<Registry>, resync_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            resync_interval,
            cache: RwLock::new(FxHashMap::default()),
            handlers: RwLock::new(Vec::new()),
        })
    }

    /// Resync interval from `CARAVEL_RESYNC_SECS`, default 30s.
    pub fn default_resync_interval() -> Duration {
        let secs = std::env::var("CARAVEL_RESYNC_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(30);
        Duration::from_secs(secs.max(1))
    }

    pub fn add_handler(&self, handler: Arc<dyn ServiceEventHandler>) {
        self.handlers.write().unwrap().push(handler);
    }

    /// Runs the event-drain worker and the resync timer until `stop` fires.
    /// The two run as separate tasks so resync keeps repairing state even
    /// under sustained event bursts.
    pub async fn run(self: Arc<Self>, stop: watch::Receiver<bool>) {
        info!(resync_secs = self.resync_interval.as_secs(), "notifier starting");
        let (events, subscription) = self.registry.subscribe();

        let watcher = {
            let this = Arc::clone(&self);
            let stop = stop.clone();
            tokio::spawn(async move {
                this.watch_loop(events, stop).await;
                drop(subscription);
            })
        };
        let resyncer = {
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.resync_loop(stop).await })
        };

        let _ = tokio::join!(watcher, resyncer);
        info!("notifier stopped");
    }

    async fn watch_loop(&self, mut events: mpsc::Receiver<Event>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.process_event(event),
                    None => {
                        warn!("registry event channel closed; watch loop exiting");
                        return;
                    }
                },
                _ = stop.changed() => return,
            }
        }
    }

    async fn resync_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.resync_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.resync(),
                _ = stop.changed() => return,
            }
        }
    }

    /// Real-time path: consults the version cache to suppress duplicates and
    /// classify the event.
    fn process_event(&self, event: Event) {
        let key = event.key;
        let new_rv = event.resource_version;

        if event.event_type == EventType::Deleted {
            let known = self.cache.write().unwrap().remove(&key).is_some();
            if known {
                self.distribute(EventType::Deleted, &event.object);
            }
            return;
        }

        let cached = self.cache.read().unwrap().get(&key).cloned();
        match cached {
            None => {
                self.cache.write().unwrap().insert(key, new_rv);
                self.distribute(EventType::Added, &event.object);
            }
            Some(old_rv) if old_rv == new_rv => {
                // Duplicate delivery; the cache already reflects it.
            }
            Some(_) => {
                self.cache.write().unwrap().insert(key, new_rv);
                self.distribute(EventType::Modified, &event.object);
            }
        }
    }

    /// Safety net: relists the registry, emits the callbacks needed to bring
    /// any consumer built from the cache up to date, then replaces the cache.
    pub fn resync(&self) {
        debug!("running notifier resync");
        counter!("notifier_resync_total", 1u64);

        let (services, _global_rv) = match self.registry.list("") {
            Ok(listed) => listed,
            Err(e) => {
                error!(error = %e, "resync list failed");
                return;
            }
        };

        let snapshot = self.cache.read().unwrap().clone();
        let mut fresh: FxHashMap<String, String> = FxHashMap::default();

        for service in &services {
            let key = caravel_core::object_key(
                &service.metadata.namespace,
                &service.metadata.name,
            );
            let rv = service.metadata.resource_version.clone();
            match snapshot.get(&key) {
                None => self.distribute(EventType::Added, service),
                Some(old_rv) if *old_rv != rv => {
                    self.distribute(EventType::Modified, service)
                }
                Some(_) => {}
            }
            fresh.insert(key, rv);
        }

        for (key, last_rv) in &snapshot {
            if !fresh.contains_key(key) {
                self.distribute(EventType::Deleted, &tombstone(key, last_rv));
            }
        }

        *self.cache.write().unwrap() = fresh;
        debug!("notifier resync complete");
    }

    fn distribute(&self, event_type: EventType, obj: &Service) {
        let handlers = self.handlers.read().unwrap();
        for handler in handlers.iter() {
            match event_type {
                EventType::Added => handler.on_add(obj),
                EventType::Modified => handler.on_update(obj, obj),
                EventType::Deleted => handler.on_delete(obj),
            }
        }
    }

    /// Cache snapshot, exposed for tests and introspection.
    pub fn cached_versions(&self) -> FxHashMap<String, String> {
        self.cache.read().unwrap().clone()
    }
}

/// Minimal object carrying enough identity to deliver a delete after a
/// relist found the key gone.
fn tombstone(key: &str, last_rv: &str) -> Service {
    let mut obj = Service::default();
    if let Some((namespace, name)) = split_key(key) {
        obj.metadata.namespace = namespace.to_string();
        obj.metadata.name = name.to_string();
    }
    obj.metadata.resource_version = last_rv.to_string();
    obj
}
