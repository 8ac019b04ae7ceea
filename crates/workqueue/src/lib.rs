//! Caravel work queue: deduping, rate-limited queue of object keys.
//!
//! Guarantees at most one pending plus at most one in-flight instance of any
//! key, across any number of worker tasks. A key added while it is being
//! processed is marked dirty and re-enqueued once `done` is called, so
//! overlapping notifications coalesce into a single extra pass.

#![forbid(unsafe_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::debug;

/// Baseline delay for the first retry of a key.
pub const BASE_DELAY: Duration = Duration::from_millis(5);
/// Upper bound for the exponential backoff schedule.
pub const MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct Inner {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    dirty: HashSet<String>,
    failures: FxHashMap<String, u32>,
    shutdown: bool,
}

/// Shared work queue. Clone the [`Arc`] into each producer and worker.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        })
    }

    /// Enqueues `key` unless it is already pending. If the key is in flight
    /// it is marked dirty and will be re-enqueued by [`WorkQueue::done`].
    pub fn add(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown || inner.queued.contains(key) {
            return;
        }
        if inner.in_flight.contains(key) {
            inner.dirty.insert(key.to_string());
            return;
        }
        inner.queued.insert(key.to_string());
        inner.queue.push_back(key.to_string());
        counter!("workqueue_adds_total", 1u64);
        drop(inner);
        self.notify.notify_one();
    }

    /// Like [`WorkQueue::add`], delayed by an exponential backoff keyed by the
    /// key's failure count. Each call increments the count.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutdown {
                return;
            }
            let failures = inner.failures.entry(key.to_string()).or_insert(0);
            let delay = backoff_for(*failures);
            *failures += 1;
            delay
        };
        counter!("workqueue_retries_total", 1u64);
        debug!(key = %key, delay_ms = delay.as_millis() as u64, "requeueing with backoff");

        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Clears the key's failure count. Called after a successful pass, or
    /// when giving up on the key.
    pub fn forget(&self, key: &str) {
        self.inner.lock().unwrap().failures.remove(key);
    }

    /// How many times the key has been requeued with backoff since the last
    /// [`WorkQueue::forget`].
    pub fn num_requeues(&self, key: &str) -> u32 {
        *self
            .inner
            .lock()
            .unwrap()
            .failures
            .get(key)
            .unwrap_or(&0)
    }

    /// Waits for the next key and marks it in flight. Returns `None` once the
    /// queue has been shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.shutdown {
                    return None;
                }
                if let Some(key) = inner.queue.pop_front() {
                    inner.queued.remove(&key);
                    inner.in_flight.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Releases the in-flight mark. A key that went dirty while it was being
    /// processed is re-enqueued immediately (without rate limit).
    pub fn done(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight.remove(key);
        if inner.dirty.remove(key) && !inner.shutdown && !inner.queued.contains(key) {
            inner.queued.insert(key.to_string());
            inner.queue.push_back(key.to_string());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Stops the queue: pending keys are discarded and every blocked
    /// [`WorkQueue::get`] returns `None`.
    pub fn shut_down(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown = true;
        inner.queue.clear();
        inner.queued.clear();
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exponential schedule: 5ms, 10ms, 20ms, ... capped at 1000s.
fn backoff_for(failures: u32) -> Duration {
    let exp = failures.min(63);
    let delay = BASE_DELAY.saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
    delay.min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_get_done_cycle() {
        let q = WorkQueue::new();
        q.add("default/web");
        let key = q.get().await.unwrap();
        assert_eq!(key, "default/web");
        q.done(&key);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce_while_pending() {
        let q = WorkQueue::new();
        q.add("k");
        q.add("k");
        q.add("k");
        assert_eq!(q.len(), 1);
        let key = q.get().await.unwrap();
        q.done(&key);
        assert!(q.is_empty(), "no ghost re-enqueue for clean keys");
    }

    #[tokio::test]
    async fn in_flight_adds_cause_exactly_one_requeue() {
        let q = WorkQueue::new();
        q.add("k");
        let key = q.get().await.unwrap();

        // Two notifications land while the key is being processed.
        q.add("k");
        q.add("k");
        assert_eq!(q.len(), 0, "in-flight key must not be queued again");

        q.done(&key);
        assert_eq!(q.len(), 1, "dirty key re-enqueued once");
        let again = q.get().await.unwrap();
        assert_eq!(again, "k");
        q.done(&again);
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off_exponentially() {
        let q = WorkQueue::new();

        q.add_rate_limited("k");
        assert_eq!(q.num_requeues("k"), 1);
        // First retry lands after the base delay.
        tokio::time::sleep(BASE_DELAY).await;
        tokio::task::yield_now().await;
        let key = q.get().await.unwrap();
        q.done(&key);

        q.add_rate_limited("k");
        assert_eq!(q.num_requeues("k"), 2);
        // Second retry needs twice the base delay.
        tokio::time::sleep(BASE_DELAY).await;
        tokio::task::yield_now().await;
        assert!(q.is_empty(), "not yet due");
        tokio::time::sleep(BASE_DELAY).await;
        tokio::task::yield_now().await;
        let key = q.get().await.unwrap();
        q.done(&key);

        q.forget("k");
        assert_eq!(q.num_requeues("k"), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_blocked_getters() {
        let q = WorkQueue::new();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        // Let the getter park first.
        tokio::task::yield_now().await;
        q.shut_down();
        let got = waiter.await.unwrap();
        assert!(got.is_none());

        q.add("late");
        assert!(q.get().await.is_none(), "adds after shutdown are ignored");
    }

    #[test]
    fn backoff_schedule_doubles_and_caps() {
        assert_eq!(backoff_for(0), Duration::from_millis(5));
        assert_eq!(backoff_for(1), Duration::from_millis(10));
        assert_eq!(backoff_for(4), Duration::from_millis(80));
        assert_eq!(backoff_for(40), MAX_DELAY);
    }
}
