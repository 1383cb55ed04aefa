//! Client configuration
//!
//! Read required credentials from the environment (via `.env` if
//! present), fall back to documented defaults for everything else,
//! and let callers override individual fields with plain builder
//! methods.

use crate::error::{Error, Result};
use std::env;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.gateway.example.com";

/// Jittered exponential backoff parameters shared by the push
/// reconnect loop (§4.3) and the poll loop (§4.4).
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    /// Fractional jitter applied symmetrically, e.g. `0.3` means ±30%.
    pub jitter: f64,
}

impl BackoffConfig {
    /// Defaults for the push strategy's reconnect backoff (§4.3):
    /// initial 1s, cap 30s, factor 2, jitter ±30%.
    #[must_use]
    pub const fn push_defaults() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.3,
        }
    }
}

/// Adaptive polling parameters (§4.4): initial 2s, factor 1.5, cap
/// 30s, jitter ±30%.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(30),
            factor: 1.5,
            jitter: 0.3,
        }
    }
}

/// Which delivery strategy (C3/C4/C5) the client drives. Defaults to
/// `Auto`, which is the only mode that self-selects between the
/// other two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    Push,
    Poll,
    #[default]
    Auto,
}

/// Configuration for a [`crate::Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub poll: PollConfig,
    pub push_backoff: BackoffConfig,
    pub mode: DeliveryMode,
    /// Auto strategy (§4.5): how long to wait for the push connection
    /// before falling back to polling.
    pub auto_fallback_timeout: Duration,
    /// Per-event fetch timeout used by the registry dispatch (§4.7).
    pub event_fetch_timeout: Duration,
}

impl ClientConfig {
    /// Build a config from explicit values, using documented defaults
    /// for everything not related to credentials/endpoint.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            poll: PollConfig::default(),
            push_backoff: BackoffConfig::push_defaults(),
            mode: DeliveryMode::default(),
            auto_fallback_timeout: Duration::from_secs(5),
            event_fetch_timeout: Duration::from_secs(30),
        }
    }

    /// Load configuration from the environment (reads `.env` if
    /// present).
    ///
    /// Required: `GATEWAY_API_KEY`.
    /// Optional (with defaults): `GATEWAY_BASE_URL`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCredential`] if `GATEWAY_API_KEY` is
    /// unset.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let api_key = env::var("GATEWAY_API_KEY")
            .map_err(|_| Error::MissingCredential("GATEWAY_API_KEY"))?;
        let base_url =
            env::var("GATEWAY_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        Ok(Self::new(base_url, api_key))
    }

    #[must_use]
    pub const fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    #[must_use]
    pub const fn with_push_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.push_backoff = backoff;
        self
    }

    #[must_use]
    pub const fn with_auto_fallback_timeout(mut self, timeout: Duration) -> Self {
        self.auto_fallback_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }
}
