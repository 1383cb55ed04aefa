//! Per-inbox fan-out subscription manager (C2, §4.2)
//!
//! The invariant that matters: no callback fires after its
//! `unsubscribe` returns. `unsubscribe` flips the subscription's
//! active flag *before* removing it from the map, which closes the
//! read-then-invoke race `notify` would otherwise have (§9).

use crate::email::Email;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

pub type Callback = Arc<dyn Fn(Email) + Send + Sync>;

struct Subscription {
    active: Arc<AtomicBool>,
    callback: Callback,
}

/// A handle returned by [`SubscriptionManager::subscribe`]. Dropping
/// it does *not* unsubscribe -- callers must call
/// [`SubscriptionHandle::unsubscribe`] explicitly, matching the
/// explicit-lifecycle style the wait primitives (§4.8) rely on.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inbox_hash: String,
    id: u64,
    active: Arc<AtomicBool>,
    manager: SubscriptionManager,
}

impl SubscriptionHandle {
    /// Idempotent: calling this more than once is a no-op after the
    /// first call.
    pub async fn unsubscribe(&self) {
        self.manager.unsubscribe_inner(&self.inbox_hash, self.id, &self.active).await;
    }
}

/// Fan-out manager owning all live subscriptions, keyed by inbox
/// hash then subscription id.
#[derive(Clone, Default)]
pub struct SubscriptionManager {
    inner: Arc<RwLock<HashMap<String, HashMap<u64, Subscription>>>>,
    next_id: Arc<AtomicU64>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, inbox_hash: &str, callback: Callback) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));

        let mut guard = self.inner.write().await;
        guard.entry(inbox_hash.to_string()).or_default().insert(
            id,
            Subscription {
                active: Arc::clone(&active),
                callback,
            },
        );
        drop(guard);

        SubscriptionHandle {
            inbox_hash: inbox_hash.to_string(),
            id,
            active,
            manager: self.clone(),
        }
    }

    async fn unsubscribe_inner(&self, inbox_hash: &str, id: u64, active: &AtomicBool) {
        // Flip the flag before touching the map: any `notify` call
        // that already snapshotted this subscription will observe
        // `active == false` and skip the callback.
        active.store(false, Ordering::SeqCst);

        let mut guard = self.inner.write().await;
        if let Some(subs) = guard.get_mut(inbox_hash) {
            subs.remove(&id);
            if subs.is_empty() {
                guard.remove(inbox_hash);
            }
        }
    }

    /// Snapshot the live subscriptions for `inbox_hash` under the
    /// read lock, release it, then invoke each still-active callback.
    /// Callbacks run outside any internal lock (§5).
    pub async fn notify(&self, inbox_hash: &str, email: &Email) {
        let snapshot: Vec<(Arc<AtomicBool>, Callback)> = {
            let guard = self.inner.read().await;
            guard
                .get(inbox_hash)
                .map(|subs| {
                    subs.values()
                        .map(|s| (Arc::clone(&s.active), Arc::clone(&s.callback)))
                        .collect()
                })
                .unwrap_or_default()
        };

        for (active, callback) in snapshot {
            if active.load(Ordering::SeqCst) {
                callback(email.clone());
            }
        }
    }

    /// Deactivate and drop every subscription across every inbox.
    pub async fn clear(&self) {
        let mut guard = self.inner.write().await;
        for subs in guard.values() {
            for sub in subs.values() {
                sub.active.store(false, Ordering::SeqCst);
            }
        }
        guard.clear();
    }

    #[cfg(test)]
    async fn subscriber_count(&self, inbox_hash: &str) -> usize {
        self.inner
            .read()
            .await
            .get(inbox_hash)
            .map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_email;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn unsubscribe_removes_entry_and_stops_future_notifies() {
        let manager = SubscriptionManager::new();
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = Arc::clone(&received);

        let handle = manager
            .subscribe(
                "hash-1",
                Arc::new(move |_email| {
                    received_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        manager.notify("hash-1", &sample_email("e1")).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);

        handle.unsubscribe().await;
        manager.notify("hash-1", &sample_email("e2")).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert_eq!(manager.subscriber_count("hash-1").await, 0);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let manager = SubscriptionManager::new();
        let handle = manager.subscribe("hash-1", Arc::new(|_| {})).await;
        handle.unsubscribe().await;
        handle.unsubscribe().await;
    }

    #[tokio::test]
    async fn fan_out_delivers_to_every_active_subscriber() {
        let manager = SubscriptionManager::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let count = Arc::clone(&count);
            manager
                .subscribe("hash-1", Arc::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }))
                .await;
        }

        manager.notify("hash-1", &sample_email("e1")).await;
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn no_callback_fires_after_unsubscribe_returns_under_contention() {
        // Races `notify` against `unsubscribe` repeatedly; any
        // callback observed after `unsubscribe` returned would be a
        // violation of the core invariant (§8).
        for _ in 0..200 {
            let manager = SubscriptionManager::new();
            let fired_after_unsub = Arc::new(AtomicBool::new(false));
            let unsubscribed = Arc::new(AtomicBool::new(false));

            let fired_clone = Arc::clone(&fired_after_unsub);
            let unsub_clone = Arc::clone(&unsubscribed);
            let handle = manager
                .subscribe(
                    "hash-1",
                    Arc::new(move |_| {
                        if unsub_clone.load(Ordering::SeqCst) {
                            fired_clone.store(true, Ordering::SeqCst);
                        }
                    }),
                )
                .await;

            let notifier = {
                let manager = manager.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        manager.notify("hash-1", &sample_email("e")).await;
                        tokio::task::yield_now().await;
                    }
                })
            };

            tokio::time::sleep(Duration::from_micros(10)).await;
            unsubscribed.store(true, Ordering::SeqCst);
            handle.unsubscribe().await;

            notifier.await.unwrap();
            assert!(!fired_after_unsub.load(Ordering::SeqCst));
        }
    }
}
