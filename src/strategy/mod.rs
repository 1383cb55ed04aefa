//! Delivery strategies (C3/C4/C5, §4.3-§4.5)
//!
//! Push and Poll are independent state machines; Auto composes both
//! without needing a shared trait object, since it owns exactly one
//! of each. [`Strategy`] is the thin enum the registry holds so it
//! doesn't need to know which concrete strategy is active.

mod auto;
mod poll;
mod push;

pub use auto::AutoStrategy;
pub use poll::PollStrategy;
pub use push::PushStrategy;

use crate::config::BackoffConfig;
use crate::email::Email;
use crate::error::Error;
use crate::inbox::Inbox;
use crate::subscription::SubscriptionManager;
use crate::sync::SyncState;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Invoked by the push strategy for every `{inboxHash, emailID}`
/// record it receives (§4.7 step dispatch happens inside this
/// callback, owned by the registry).
pub type EventCallback = Arc<dyn Fn(String, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked once per successful `Connected` transition (§4.3, §4.6).
pub type ReconnectCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Non-fatal per-email sync/decrypt failure (§4.6 step 8, §4.7 step 6).
pub type SyncErrorCallback = Arc<dyn Fn(String, Error) + Send + Sync>;

/// Everything the poll strategy needs to run the reconcile loop for
/// one inbox; the push strategy only consumes `inbox_hash`.
#[derive(Clone)]
pub struct StrategyTarget {
    pub inbox_hash: String,
    pub inbox: Arc<Inbox>,
    pub sync_state: Arc<SyncState>,
    pub subscriptions: SubscriptionManager,
    pub on_sync_error: SyncErrorCallback,
}

/// A running strategy, held by the registry without needing to know
/// which concrete kind is active.
#[derive(Clone)]
pub enum Strategy {
    Push(Arc<PushStrategy>),
    Poll(Arc<PollStrategy>),
    Auto(Arc<AutoStrategy>),
}

impl Strategy {
    pub async fn add_inbox(&self, target: StrategyTarget) {
        match self {
            Self::Push(s) => s.add_inbox(target.inbox_hash).await,
            Self::Poll(s) => s.add_inbox(target).await,
            Self::Auto(s) => s.add_inbox(target).await,
        }
    }

    pub async fn remove_inbox(&self, inbox_hash: &str) {
        match self {
            Self::Push(s) => s.remove_inbox(inbox_hash).await,
            Self::Poll(s) => s.remove_inbox(inbox_hash).await,
            Self::Auto(s) => s.remove_inbox(inbox_hash).await,
        }
    }

    pub async fn stop(&self) {
        match self {
            Self::Push(s) => s.stop(),
            Self::Poll(s) => s.stop().await,
            Self::Auto(s) => s.stop().await,
        }
    }

    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Push(_) => "push".to_string(),
            Self::Poll(_) => "poll".to_string(),
            Self::Auto(s) => s.name(),
        }
    }
}

/// Shared jittered-exponential-backoff counter for push reconnect
/// (§4.3) and poll ticks (§4.4). Seeded per instance so concurrent
/// clients don't synchronize their retries (§4.4).
pub struct BackoffState {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    current: Duration,
    rng: StdRng,
}

impl BackoffState {
    #[must_use]
    pub fn from_backoff_config(config: BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.factor, config.jitter)
    }

    #[must_use]
    pub fn from_poll_config(config: crate::config::PollConfig) -> Self {
        Self::new(config.initial, config.max, config.factor, config.jitter)
    }

    #[must_use]
    pub fn new(initial: Duration, max: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            jitter,
            current: initial,
            rng: StdRng::from_entropy(),
        }
    }

    /// Return the jittered delay for the current interval, then
    /// advance the interval by `factor`, capped at `max`.
    pub fn next(&mut self) -> Duration {
        let delay = jittered(self.current, self.jitter, &mut self.rng);
        let advanced = self.current.as_secs_f64() * self.factor;
        self.current = Duration::from_secs_f64(advanced.min(self.max.as_secs_f64()));
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

fn jittered(base: Duration, jitter: f64, rng: &mut StdRng) -> Duration {
    let factor = 1.0 + rng.gen_range(-jitter..=jitter);
    Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
}

/// Used by tests and [`crate::wait`] to represent an inbox-scoped
/// email delivery, matching the fan-in shape `WatchInboxes` produces
/// (§4.8).
#[derive(Debug, Clone)]
pub struct InboxEmail {
    pub inbox_hash: String,
    pub email: Email,
}
