//! Inbox registry & push dispatch (C7, §4.7)
//!
//! Owns the by-email-address and by-inbox-hash maps under one write
//! lock, plus each inbox's [`SyncState`]. Builds the callbacks the
//! delivery strategies invoke: [`EventCallback`] for per-event push
//! dispatch and [`ReconnectCallback`] to run the sync engine across
//! every registered inbox after a push reconnect (§4.6).

use crate::email::Email;
use crate::error::{Error, Result};
use crate::inbox::Inbox;
use crate::strategy::{EventCallback, ReconnectCallback, StrategyTarget, SyncErrorCallback};
use crate::subscription::SubscriptionManager;
use crate::sync::{self, SyncState};
use crate::transport::GatewayTransport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    by_email: HashMap<String, Arc<Inbox>>,
    by_hash: HashMap<String, Arc<Inbox>>,
    sync_states: HashMap<String, Arc<SyncState>>,
}

pub struct Registry {
    transport: Arc<dyn GatewayTransport>,
    subscriptions: SubscriptionManager,
    event_fetch_timeout: Duration,
    on_sync_error: SyncErrorCallback,
    inner: RwLock<Inner>,
}

impl Registry {
    #[must_use]
    pub fn new(
        transport: Arc<dyn GatewayTransport>,
        subscriptions: SubscriptionManager,
        event_fetch_timeout: Duration,
        on_sync_error: SyncErrorCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            subscriptions,
            event_fetch_timeout,
            on_sync_error,
            inner: RwLock::new(Inner::default()),
        })
    }

    /// Register a newly created or imported inbox, under one write
    /// lock across both maps and the new `SyncState` (§4.7).
    pub async fn add_inbox(&self, inbox: Inbox) -> StrategyTarget {
        let inbox = Arc::new(inbox);
        let sync_state = Arc::new(SyncState::new());

        let mut guard = self.inner.write().await;
        guard.by_email.insert(inbox.email_address.clone(), Arc::clone(&inbox));
        guard.by_hash.insert(inbox.inbox_hash.clone(), Arc::clone(&inbox));
        guard
            .sync_states
            .insert(inbox.inbox_hash.clone(), Arc::clone(&sync_state));
        drop(guard);

        StrategyTarget {
            inbox_hash: inbox.inbox_hash.clone(),
            inbox,
            sync_state,
            subscriptions: self.subscriptions.clone(),
            on_sync_error: Arc::clone(&self.on_sync_error),
        }
    }

    /// Remove an inbox by email address, returning its hash if it was
    /// registered so the caller can drive strategy membership too.
    pub async fn remove_inbox(&self, email_address: &str) -> Option<String> {
        let mut guard = self.inner.write().await;
        let inbox = guard.by_email.remove(email_address)?;
        guard.by_hash.remove(&inbox.inbox_hash);
        guard.sync_states.remove(&inbox.inbox_hash);
        Some(inbox.inbox_hash.clone())
    }

    pub async fn get_by_email(&self, email_address: &str) -> Option<Arc<Inbox>> {
        self.inner.read().await.by_email.get(email_address).cloned()
    }

    pub async fn get_by_hash(&self, inbox_hash: &str) -> Option<Arc<Inbox>> {
        self.inner.read().await.by_hash.get(inbox_hash).cloned()
    }

    pub async fn all_inboxes(&self) -> Vec<Arc<Inbox>> {
        self.inner.read().await.by_hash.values().cloned().collect()
    }

    /// Build the callback the push strategy invokes per event
    /// record (§4.7).
    #[must_use]
    pub fn event_callback(self: &Arc<Self>) -> EventCallback {
        let this = Arc::clone(self);
        Arc::new(move |inbox_hash, email_id| {
            let this = Arc::clone(&this);
            Box::pin(async move { this.dispatch_push_event(inbox_hash, email_id).await })
        })
    }

    /// Build the callback the push strategy invokes once per
    /// `Connected` transition, running the sync engine over every
    /// registered inbox (§4.6).
    #[must_use]
    pub fn reconnect_callback(self: &Arc<Self>) -> ReconnectCallback {
        let this = Arc::clone(self);
        Arc::new(move || {
            let this = Arc::clone(&this);
            Box::pin(async move { this.reconcile_all().await })
        })
    }

    async fn dispatch_push_event(&self, inbox_hash: String, email_id: String) {
        let (inbox, sync_state) = {
            let guard = self.inner.read().await;
            (
                guard.by_hash.get(&inbox_hash).cloned(),
                guard.sync_states.get(&inbox_hash).cloned(),
            )
        };
        let (Some(inbox), Some(sync_state)) = (inbox, sync_state) else {
            // Unknown hash: drop silently (§4.7 step 1).
            return;
        };

        let fetch = sync::fetch_and_decrypt(&inbox, self.transport.as_ref(), &email_id);
        let email: Email = match tokio::time::timeout(self.event_fetch_timeout, fetch).await {
            Ok(Ok(email)) => email,
            Ok(Err(err)) => {
                (self.on_sync_error)(email_id, err);
                return;
            }
            Err(_) => {
                (self.on_sync_error)(email_id, Error::Timeout);
                return;
            }
        };

        if sync_state.insert(email.id.clone()).await {
            self.subscriptions.notify(&inbox_hash, &email).await;
        }
    }

    async fn reconcile_all(&self) {
        let targets: Vec<(Arc<Inbox>, Arc<SyncState>)> = {
            let guard = self.inner.read().await;
            guard
                .by_hash
                .values()
                .filter_map(|inbox| {
                    guard
                        .sync_states
                        .get(&inbox.inbox_hash)
                        .map(|state| (Arc::clone(inbox), Arc::clone(state)))
                })
                .collect()
        };

        for (inbox, sync_state) in targets {
            let outcome = sync::reconcile_inbox(
                &inbox,
                &sync_state,
                self.transport.as_ref(),
                &self.subscriptions,
                &self.on_sync_error,
            )
            .await;
            if let Err(err) = outcome {
                tracing::warn!(
                    inbox = %inbox.email_address,
                    error = %err,
                    "reconnect sync failed"
                );
                (self.on_sync_error)(String::new(), err);
            }
        }
    }
}
