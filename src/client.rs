//! Client facade
//!
//! Wires the registry (C7), subscription manager (C2), and the
//! configured delivery strategy (C3/C4/C5) together behind the public
//! API. The delivery strategy is built eagerly but its connect loop
//! is only started once the first inbox is registered -- this
//! resolves the open question of push behavior on an empty initial
//! inbox set by skipping the connection entirely until then.

use crate::config::{ClientConfig, DeliveryMode};
use crate::email::Email;
use crate::error::{Error, Result};
use crate::inbox::{ExportedInbox, Inbox};
use crate::registry::Registry;
use crate::strategy::{AutoStrategy, PollStrategy, PushStrategy, ReconnectCallback, Strategy, SyncErrorCallback};
use crate::subscription::{SubscriptionHandle, SubscriptionManager};
use crate::transport::{CreateInboxOptions, CreateInboxResult, GatewayTransport, HttpGatewayTransport, ServerInfo};
use crate::wait::{self, MatchOptions, WaitForEmailCountResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Client SDK entry point for the email testing gateway.
pub struct Client {
    config: ClientConfig,
    transport: Arc<dyn GatewayTransport>,
    subscriptions: SubscriptionManager,
    registry: Arc<Registry>,
    strategy: Strategy,
    strategy_started: Mutex<bool>,
    on_reconnect_handlers: Mutex<Vec<ReconnectCallback>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

fn default_sync_error_logger() -> SyncErrorCallback {
    Arc::new(|email_id, err| {
        tracing::warn!(email_id = %email_id, error = %err, "sync error");
    })
}

impl Client {
    /// Build a client from config, using the default `reqwest`-backed
    /// transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(HttpGatewayTransport::new(&config.base_url, &config.api_key)?);
        Ok(Self::with_transport(config, transport))
    }

    /// Build a client around an arbitrary transport, e.g. a fake one
    /// used in tests to drive the delivery core deterministically.
    #[must_use]
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn GatewayTransport>) -> Self {
        let subscriptions = SubscriptionManager::new();
        let registry = Registry::new(
            Arc::clone(&transport),
            subscriptions.clone(),
            config.event_fetch_timeout,
            default_sync_error_logger(),
        );

        let strategy = match config.mode {
            DeliveryMode::Push => Strategy::Push(PushStrategy::new(Arc::clone(&transport), config.push_backoff)),
            DeliveryMode::Poll => Strategy::Poll(PollStrategy::new(Arc::clone(&transport), config.poll)),
            DeliveryMode::Auto => Strategy::Auto(AutoStrategy::new(Arc::clone(&transport), &config)),
        };

        Self {
            config,
            transport,
            subscriptions,
            registry,
            strategy,
            strategy_started: Mutex::new(false),
            on_reconnect_handlers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a callback fired once per successful reconnect of the
    /// push-backed delivery path (§4.5 point 5). Must be called
    /// before the first inbox is registered to take effect.
    pub async fn on_reconnect(&self, callback: ReconnectCallback) {
        self.on_reconnect_handlers.lock().await.push(callback);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ClientClosed);
        }
        Ok(())
    }

    pub async fn check_key(&self) -> Result<()> {
        self.ensure_open()?;
        self.transport.check_key().await
    }

    pub async fn get_server_info(&self) -> Result<ServerInfo> {
        self.ensure_open()?;
        self.transport.get_server_info().await
    }

    /// Create a new temporary inbox. When `opts.kem_public_key` is
    /// left unset and the caller wants encryption, generate a fresh
    /// keypair locally before calling the transport -- per §4.9, each
    /// inbox exclusively owns its keypair and only the public half
    /// ever leaves the client.
    pub async fn create_inbox(&self, mut opts: CreateInboxOptions, encrypted: bool) -> Result<Inbox> {
        self.ensure_open()?;

        let keypair = if encrypted {
            let keypair = crate::inbox::Keypair::generate();
            opts.kem_public_key = Some(keypair.public_key.clone());
            Some(keypair)
        } else {
            None
        };

        let result: CreateInboxResult = self.transport.create_inbox(opts).await?;

        let server_signing_public_key = result
            .server_signing_public_key
            .map(|b64| crate::b64::decode(&b64))
            .transpose()
            .map_err(|e| Error::InvalidImportData(format!("malformed serverSigningPublicKey: {e}")))?;

        let inbox = Inbox {
            email_address: result.email_address,
            inbox_hash: result.inbox_hash,
            expires_at: result.expires_at,
            encrypted: result.encrypted,
            email_auth: result.email_auth,
            keypair,
            server_signing_public_key,
        };
        inbox.validate()?;

        self.register_inbox(inbox.clone()).await;
        Ok(inbox)
    }

    /// Import a previously exported inbox (§4.9). Confirms the inbox
    /// still exists on the server before registering it locally;
    /// failure at any step leaves client state unchanged.
    pub async fn import_inbox(&self, exported: ExportedInbox) -> Result<Inbox> {
        self.ensure_open()?;
        let inbox = exported.into_inbox()?;

        self.transport.get_inbox_sync(&inbox.email_address).await?;

        self.register_inbox(inbox.clone()).await;
        Ok(inbox)
    }

    /// Export an inbox's identity and key material (§4.9).
    pub async fn export_inbox(&self, email_address: &str) -> Result<ExportedInbox> {
        self.ensure_open()?;
        let inbox = self
            .registry
            .get_by_email(email_address)
            .await
            .ok_or_else(|| Error::InboxNotFound(email_address.to_string()))?;
        Ok(inbox.export(chrono::Utc::now()))
    }

    async fn register_inbox(&self, inbox: Inbox) {
        let target = self.registry.add_inbox(inbox).await;

        let mut started = self.strategy_started.lock().await;
        if *started {
            self.strategy.add_inbox(target).await;
        } else {
            *started = true;
            drop(started);
            self.start_strategy(target).await;
        }
    }

    async fn start_strategy(&self, first_target: crate::strategy::StrategyTarget) {
        let reconnect_cb = self.build_reconnect_callback().await;
        let event_cb = self.registry.event_callback();
        let initial_hash = first_target.inbox_hash.clone();

        match &self.strategy {
            Strategy::Push(push) => {
                push.start(vec![initial_hash], event_cb, reconnect_cb).await;
            }
            Strategy::Poll(poll) => {
                poll.add_inbox(first_target).await;
            }
            Strategy::Auto(auto) => {
                auto.start(vec![initial_hash], event_cb, reconnect_cb).await;
                auto.add_inbox(first_target).await;
            }
        }
    }

    async fn build_reconnect_callback(&self) -> ReconnectCallback {
        let registry_cb = self.registry.reconnect_callback();
        let user_cbs: Vec<ReconnectCallback> = self.on_reconnect_handlers.lock().await.clone();

        Arc::new(move || {
            let registry_cb = Arc::clone(&registry_cb);
            let user_cbs = user_cbs.clone();
            Box::pin(async move {
                registry_cb().await;
                for cb in &user_cbs {
                    cb().await;
                }
            })
        })
    }

    /// Stop watching an inbox locally without deleting it server-side.
    pub async fn remove_inbox(&self, email_address: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some(hash) = self.registry.remove_inbox(email_address).await {
            self.strategy.remove_inbox(&hash).await;
        }
        Ok(())
    }

    /// Delete an inbox server-side and stop watching it locally.
    pub async fn delete_inbox(&self, email_address: &str) -> Result<()> {
        self.ensure_open()?;
        self.transport.delete_inbox_by_email(email_address).await?;
        self.remove_inbox(email_address).await
    }

    pub async fn delete_all_inboxes(&self) -> Result<()> {
        self.ensure_open()?;
        self.transport.delete_all_inboxes().await
    }

    pub async fn mark_email_as_read(&self, email_address: &str, email_id: &str) -> Result<()> {
        self.ensure_open()?;
        self.transport.mark_email_as_read(email_address, email_id).await
    }

    pub async fn delete_email(&self, email_address: &str, email_id: &str) -> Result<()> {
        self.ensure_open()?;
        self.transport.delete_email(email_address, email_id).await
    }

    /// Fetch and decrypt an email's RFC 5322 source (§6).
    pub async fn get_email_raw(&self, email_address: &str, email_id: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let inbox = self
            .registry
            .get_by_email(email_address)
            .await
            .ok_or_else(|| Error::InboxNotFound(email_address.to_string()))?;
        let raw = self.transport.get_email_raw(email_address, email_id).await?;
        crate::sync::decode_raw_email(&inbox, raw)
    }

    /// Subscribe directly to an inbox (C2); lower-level than the
    /// `watch_*`/`wait_for_*` helpers below.
    pub async fn subscribe(
        &self,
        inbox_hash: &str,
        callback: crate::subscription::Callback,
    ) -> Result<SubscriptionHandle> {
        self.ensure_open()?;
        Ok(self.subscriptions.subscribe(inbox_hash, callback).await)
    }

    pub async fn watch(&self, inbox_hash: &str, cancel: CancellationToken) -> Result<tokio::sync::mpsc::Receiver<Email>> {
        self.ensure_open()?;
        Ok(wait::watch(&self.subscriptions, inbox_hash, cancel).await)
    }

    pub async fn watch_inboxes(
        &self,
        inbox_hashes: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<tokio::sync::mpsc::Receiver<crate::strategy::InboxEmail>> {
        self.ensure_open()?;
        Ok(wait::watch_inboxes(&self.subscriptions, inbox_hashes, cancel).await)
    }

    pub async fn wait_for_email(
        &self,
        email_address: &str,
        opts: &MatchOptions,
        timeout: Duration,
    ) -> Result<Email> {
        self.ensure_open()?;
        let inbox = self
            .registry
            .get_by_email(email_address)
            .await
            .ok_or_else(|| Error::InboxNotFound(email_address.to_string()))?;
        wait::wait_for_email(self.transport.as_ref(), &inbox, &self.subscriptions, opts, timeout).await
    }

    pub async fn wait_for_email_count(
        &self,
        email_address: &str,
        opts: &MatchOptions,
        n: i64,
        timeout: Duration,
    ) -> Result<WaitForEmailCountResult> {
        self.ensure_open()?;
        let inbox = self
            .registry
            .get_by_email(email_address)
            .await
            .ok_or_else(|| Error::InboxNotFound(email_address.to_string()))?;
        wait::wait_for_email_count(self.transport.as_ref(), &inbox, &self.subscriptions, opts, n, timeout).await
    }

    /// Tear down all delivery machinery. Idempotent: subsequent calls
    /// to any public method return [`Error::ClientClosed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.strategy.stop().await;
        self.subscriptions.clear().await;
    }
}
