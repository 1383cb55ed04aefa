//! Poll strategy (C4, §4.4)
//!
//! One adaptive-backoff task per inbox. A tick that finds a hash
//! mismatch resets the interval to `initial`; a tick that completes
//! cleanly with no change, or whose handler errors, backs off
//! further -- consecutive handler errors are treated as "no confirmed
//! progress" rather than forgiven (resolves the open question in
//! §4.4).

use super::{BackoffState, StrategyTarget};
use crate::config::PollConfig;
use crate::sync::reconcile_inbox;
use crate::transport::GatewayTransport;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub struct PollStrategy {
    transport: Arc<dyn GatewayTransport>,
    poll_config: PollConfig,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PollStrategy {
    #[must_use]
    pub fn new(transport: Arc<dyn GatewayTransport>, poll_config: PollConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            poll_config,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    pub async fn add_inbox(&self, target: StrategyTarget) {
        let transport = Arc::clone(&self.transport);
        let poll_config = self.poll_config;
        let inbox_hash = target.inbox_hash.clone();

        let handle = tokio::spawn(async move {
            let mut backoff = BackoffState::from_poll_config(poll_config);
            loop {
                tokio::time::sleep(backoff.next()).await;

                let outcome = reconcile_inbox(
                    &target.inbox,
                    &target.sync_state,
                    transport.as_ref(),
                    &target.subscriptions,
                    &target.on_sync_error,
                )
                .await;

                match outcome {
                    Ok(changed) => {
                        if changed {
                            backoff.reset();
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            inbox = %target.inbox.email_address,
                            error = %err,
                            "poll tick failed"
                        );
                        (target.on_sync_error)(String::new(), err);
                    }
                }
            }
        });

        let mut guard = self.tasks.lock().await;
        if let Some(old) = guard.insert(inbox_hash, handle) {
            old.abort();
        }
    }

    pub async fn remove_inbox(&self, inbox_hash: &str) {
        let mut guard = self.tasks.lock().await;
        if let Some(handle) = guard.remove(inbox_hash) {
            handle.abort();
        }
    }

    pub async fn stop(&self) {
        let mut guard = self.tasks.lock().await;
        for (_, handle) in guard.drain() {
            handle.abort();
        }
    }

    #[must_use]
    pub const fn name() -> &'static str {
        "poll"
    }
}
