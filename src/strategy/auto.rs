//! Auto strategy (C5, §4.5)
//!
//! Starts Push; if it hasn't reached `Connected` within the fallback
//! timeout, stops Push and switches to Poll for good. The fallback is
//! one-shot -- Push is never retried once Poll takes over.

use super::{EventCallback, PollStrategy, PushStrategy, ReconnectCallback, StrategyTarget};
use crate::config::ClientConfig;
use crate::transport::GatewayTransport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct AutoStrategy {
    push: Arc<PushStrategy>,
    poll: Arc<PollStrategy>,
    using_poll: AtomicBool,
    fallback_timeout: std::time::Duration,
    /// Targets registered before the fallback decision is made, so
    /// they can be replayed onto Poll if Push times out.
    pending_targets: Mutex<Vec<StrategyTarget>>,
}

impl AutoStrategy {
    #[must_use]
    pub fn new(transport: Arc<dyn GatewayTransport>, config: &ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            push: PushStrategy::new(Arc::clone(&transport), config.push_backoff),
            poll: PollStrategy::new(transport, config.poll),
            using_poll: AtomicBool::new(false),
            fallback_timeout: config.auto_fallback_timeout,
            pending_targets: Mutex::new(Vec::new()),
        })
    }

    pub async fn start(
        self: &Arc<Self>,
        initial_inboxes: Vec<String>,
        event_cb: EventCallback,
        reconnect_cb: ReconnectCallback,
    ) {
        let mut connected_rx = self.push.connected_receiver();
        self.push
            .start(initial_inboxes, event_cb, Arc::clone(&reconnect_cb))
            .await;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let became_connected = tokio::time::timeout(this.fallback_timeout, async {
                loop {
                    if *connected_rx.borrow() {
                        return;
                    }
                    if connected_rx.changed().await.is_err() {
                        return;
                    }
                }
            })
            .await
            .is_ok();

            if became_connected {
                return;
            }

            this.push.stop();
            this.using_poll.store(true, Ordering::SeqCst);

            let targets = this.pending_targets.lock().await.clone();
            for target in targets {
                this.poll.add_inbox(target).await;
            }
        });
    }

    pub async fn add_inbox(&self, target: StrategyTarget) {
        if self.using_poll.load(Ordering::SeqCst) {
            self.poll.add_inbox(target).await;
        } else {
            self.pending_targets.lock().await.push(target.clone());
            self.push.add_inbox(target.inbox_hash).await;
        }
    }

    pub async fn remove_inbox(&self, inbox_hash: &str) {
        {
            let mut guard = self.pending_targets.lock().await;
            guard.retain(|t| t.inbox_hash != inbox_hash);
        }
        if self.using_poll.load(Ordering::SeqCst) {
            self.poll.remove_inbox(inbox_hash).await;
        } else {
            self.push.remove_inbox(inbox_hash).await;
        }
    }

    pub async fn stop(&self) {
        self.push.stop();
        self.poll.stop().await;
    }

    #[must_use]
    pub fn name(&self) -> String {
        if self.using_poll.load(Ordering::SeqCst) {
            "auto:polling".to_string()
        } else {
            "auto:sse".to_string()
        }
    }
}
