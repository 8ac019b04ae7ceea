//! Caravel registry: the declarative API surface over the store.
//!
//! Every mutation runs inside one store write transaction that also bumps the
//! global resourceVersion counter, then publishes a change event to all
//! subscribers. Readers see consistent snapshots. Optimistic concurrency on
//! spec updates is enforced by comparing the caller's resourceVersion against
//! the stored one inside the transaction.

#![forbid(unsafe_code)]

mod bus;
mod service;

use std::sync::Arc;

use caravel_core::{Error, Service};
use caravel_store::Store;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use bus::{EventBus, Subscription};

/// The kind of change a committed transaction made.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// A committed change, published to every subscriber.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    /// `"<namespace>/<name>"` of the changed object.
    pub key: String,
    /// Post-commit object (pre-delete object for `Deleted`).
    pub object: Service,
    /// The object's resourceVersion after the commit (last version for
    /// `Deleted`).
    pub resource_version: String,
}

/// Registry over one store. Cheap to share behind an [`Arc`].
pub struct Registry {
    store: Arc<Store>,
    bus: EventBus,
}

impl Registry {
    pub fn new(store: Arc<Store>) -> Result<Arc<Self>, Error> {
        store.ensure_bucket(caravel_store::SERVICES_TABLE)?;
        Ok(Arc::new(Self {
            store,
            bus: EventBus::new(event_buffer_capacity()),
        }))
    }

    /// Registers a change-event subscriber. The receiver is bounded; when it
    /// falls behind, events are dropped and the notifier's resync repairs the
    /// gap. Cancelling (or dropping) the subscription closes the channel.
    pub fn subscribe(&self) -> (mpsc::Receiver<Event>, Subscription) {
        self.bus.subscribe()
    }

    /// Closes all subscriber channels. Called on shutdown.
    pub fn shutdown(&self) {
        self.bus.close_all();
    }

    fn publish(&self, event: Event) {
        self.bus.publish(event);
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }
}

fn event_buffer_capacity() -> usize {
    std::env::var("CARAVEL_EVENT_BUF")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100)
}

/// Maps any displayable fault into the internal error kind. Used for store
/// and serialization failures inside transactions.
pub(crate) fn internal(e: impl std::fmt::Display) -> Error {
    Error::Internal(e.to_string())
}
