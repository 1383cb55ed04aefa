//! Push (stream) strategy (C3, §4.3)
//!
//! State machine: `Idle -> Connecting -> Connected -> (Reconnecting
//! -> Connected)* -> Stopped`. One long-lived connection carries
//! events for every currently registered inbox hash; membership
//! changes tear down and reconnect with the new set.

use super::{BackoffState, EventCallback, ReconnectCallback};
use crate::config::BackoffConfig;
use crate::transport::GatewayTransport;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

pub struct PushStrategy {
    transport: Arc<dyn GatewayTransport>,
    backoff_config: BackoffConfig,
    membership: Mutex<HashSet<String>>,
    restart: watch::Sender<u64>,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl PushStrategy {
    #[must_use]
    pub fn new(transport: Arc<dyn GatewayTransport>, backoff_config: BackoffConfig) -> Arc<Self> {
        let (restart, _) = watch::channel(0u64);
        let (connected, _) = watch::channel(false);
        Arc::new(Self {
            transport,
            backoff_config,
            membership: Mutex::new(HashSet::new()),
            restart,
            connected,
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the connect loop. `event_cb` is invoked for every event
    /// record; `reconnect_cb` runs once per `Connected` transition
    /// (§4.6: this is what triggers the sync engine).
    pub async fn start(
        self: &Arc<Self>,
        initial_inboxes: Vec<String>,
        event_cb: EventCallback,
        reconnect_cb: ReconnectCallback,
    ) {
        {
            let mut guard = self.membership.lock().await;
            guard.extend(initial_inboxes);
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(event_cb, reconnect_cb).await });
    }

    async fn run(self: Arc<Self>, event_cb: EventCallback, reconnect_cb: ReconnectCallback) {
        let mut backoff = BackoffState::from_backoff_config(self.backoff_config);

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            // Subscribe before reading membership: a `send_modify` that
            // lands between the read and the subscribe would otherwise
            // be invisible to this receiver's `changed()` (§8).
            let mut restart_rx = self.restart.subscribe();
            let hashes: Vec<String> = self.membership.lock().await.iter().cloned().collect();

            let connect = self.transport.open_event_stream(hashes);
            let stream = tokio::select! {
                () = self.cancel.cancelled() => return,
                result = connect => result,
            };

            let mut stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!(error = %err, "push connect failed, backing off");
                    let delay = backoff.next();
                    tokio::select! {
                        () = self.cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {},
                    }
                    continue;
                }
            };

            backoff.reset();
            let _ = self.connected.send(true);
            reconnect_cb().await;

            loop {
                tokio::select! {
                    () = self.cancel.cancelled() => {
                        let _ = self.connected.send(false);
                        return;
                    }
                    changed = restart_rx.changed() => {
                        if changed.is_err() {
                            let _ = self.connected.send(false);
                            return;
                        }
                        break;
                    }
                    item = stream.next() => match item {
                        Some(Ok(event)) => {
                            event_cb(event.inbox_hash, event.email_id).await;
                        }
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "push stream error, reconnecting");
                            break;
                        }
                        None => {
                            tracing::debug!("push stream closed, reconnecting");
                            break;
                        }
                    },
                }
            }

            let _ = self.connected.send(false);
        }
    }

    pub async fn add_inbox(&self, inbox_hash: String) {
        let mut guard = self.membership.lock().await;
        if guard.insert(inbox_hash) {
            drop(guard);
            self.restart.send_modify(|gen| *gen += 1);
        }
    }

    pub async fn remove_inbox(&self, inbox_hash: &str) {
        let mut guard = self.membership.lock().await;
        if guard.remove(inbox_hash) {
            drop(guard);
            self.restart.send_modify(|gen| *gen += 1);
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Subscribe to `Connected`/`Reconnecting` transitions; used by
    /// [`super::AutoStrategy`] to race against its fallback timeout.
    #[must_use]
    pub fn connected_receiver(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    #[must_use]
    pub const fn name() -> &'static str {
        "push"
    }
}
