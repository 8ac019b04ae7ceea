//! Per-subscriber buffered fan-out of registry change events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::warn;

use crate::Event;

struct BusInner {
    subs: RwLock<FxHashMap<u64, mpsc::Sender<Event>>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// Fan-out hub owned by the registry. Publishing never blocks the writer: a
/// subscriber whose buffer is full loses the event (the resync path is the
/// system of record).
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subs: RwLock::new(FxHashMap::default()),
                next_id: AtomicU64::new(0),
                capacity,
            }),
        }
    }

    pub fn subscribe(&self) -> (mpsc::Receiver<Event>, Subscription) {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subs.write().unwrap().insert(id, tx);
        (
            rx,
            Subscription {
                id,
                bus: Arc::downgrade(&self.inner),
            },
        )
    }

    /// Delivers `event` to every live subscriber. Per-subscriber ordering
    /// follows commit order because the registry publishes serially from the
    /// writer's thread.
    pub fn publish(&self, event: Event) {
        let mut dead = Vec::new();
        {
            let subs = self.inner.subs.read().unwrap();
            for (id, tx) in subs.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        counter!("registry_events_dropped_total", 1u64);
                        warn!(key = %event.key, subscriber = id, "event buffer full; dropping event");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }
        if !dead.is_empty() {
            let mut subs = self.inner.subs.write().unwrap();
            for id in dead {
                subs.remove(&id);
            }
        }
    }

    pub fn close_all(&self) {
        self.inner.subs.write().unwrap().clear();
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner.subs.read().unwrap().len()
    }
}

/// Cancellation handle for one subscription. Cancelling (or dropping) removes
/// the sender from the bus, which closes the subscriber's channel.
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn cancel(self) {
        // Drop does the work.
    }

    fn remove(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subs.write().unwrap().remove(&self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caravel_core::Service;
    use crate::EventType;

    fn event(key: &str) -> Event {
        Event {
            event_type: EventType::Added,
            key: key.to_string(),
            object: Service::default(),
            resource_version: "1".to_string(),
        }
    }

    #[tokio::test]
    async fn subscribe_receive_cancel() {
        let bus = EventBus::new(4);
        let (mut rx, sub) = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(event("default/a"));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.key, "default/a");

        sub.cancel();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(rx.recv().await.is_none(), "cancel closes the channel");
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let bus = EventBus::new(2);
        let (mut rx, _sub) = bus.subscribe();

        for i in 0..5 {
            bus.publish(event(&format!("default/{}", i)));
        }
        // Only the first two fit; the rest were dropped, not queued.
        assert_eq!(rx.recv().await.unwrap().key, "default/0");
        assert_eq!(rx.recv().await.unwrap().key, "default/1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_publish() {
        let bus = EventBus::new(2);
        let (rx, sub) = bus.subscribe();
        drop(rx);
        // The subscription handle is still alive; publish notices the closed
        // channel and prunes the sender.
        bus.publish(event("default/x"));
        assert_eq!(bus.subscriber_count(), 0);
        drop(sub);
    }
}
