//! In-memory fake gateway for integration testing
//!
//! Implements [`GatewayTransport`] directly over a `Mutex`-guarded
//! map instead of speaking real HTTP, so the tests in
//! `integration_test.rs` can drive push dispatch, reconnect-triggered
//! resync, and the auto push/poll fallback deterministically.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use gateway_client::{
    CreateInboxOptions, CreateInboxResult, EmailMetadata, EncryptedEnvelope, Error, EventStream,
    ExportedInbox, GatewayTransport, InboxSyncResult, Keypair, RawEmailRecord, RawEmailSource,
    Result, ServerInfo, StreamEvent,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// `base64url_unpadded(SHA-256(sorted(ids) joined by 0x00))`, mirroring
/// the wire-level resync hash every scenario here depends on.
fn compute_hash<'a>(ids: impl Iterator<Item = &'a str>) -> String {
    let mut sorted: Vec<&str> = ids.collect();
    sorted.sort_unstable();

    let mut buf = Vec::new();
    for (i, id) in sorted.iter().enumerate() {
        if i > 0 {
            buf.push(0u8);
        }
        buf.extend_from_slice(id.as_bytes());
    }
    URL_SAFE_NO_PAD.encode(Sha256::digest(&buf))
}

struct StoredEmail {
    id: String,
    from: String,
    subject: String,
    received_at: DateTime<Utc>,
    text: Option<String>,
    is_read: bool,
    raw_source: Vec<u8>,
    /// Set only by [`FakeGatewayTransport::add_mitm_email`]; when
    /// present, `get_email_raw` returns this envelope instead of a
    /// plain source.
    forged_raw_envelope: Option<EncryptedEnvelope>,
}

struct FakeInbox {
    emails: Vec<StoredEmail>,
}

struct State {
    inboxes: HashMap<String, FakeInbox>,
    event_tx: Option<mpsc::UnboundedSender<StreamEvent>>,
    push_hangs: bool,
    connect_count: u64,
}

pub struct FakeGatewayTransport {
    state: Mutex<State>,
    counter: AtomicU64,
}

impl FakeGatewayTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                inboxes: HashMap::new(),
                event_tx: None,
                push_hangs: false,
                connect_count: 0,
            }),
            counter: AtomicU64::new(0),
        })
    }

    /// Register an empty inbox under `email_address`, as if the
    /// gateway had already created it.
    pub fn seed_inbox(&self, email_address: &str) {
        self.state
            .lock()
            .unwrap()
            .inboxes
            .insert(email_address.to_string(), FakeInbox { emails: Vec::new() });
    }

    /// Add a plain (unencrypted) email directly to server-side state,
    /// without emitting a push event for it.
    pub fn add_email(
        &self,
        email_address: &str,
        id: &str,
        from: &str,
        subject: &str,
        received_at: DateTime<Utc>,
        text: Option<&str>,
    ) {
        let raw_source = format!(
            "From: {from}\r\nSubject: {subject}\r\n\r\n{}",
            text.unwrap_or_default()
        )
        .into_bytes();

        let mut state = self.state.lock().unwrap();
        let inbox = state
            .inboxes
            .get_mut(email_address)
            .expect("seed_inbox must be called before add_email");
        inbox.emails.push(StoredEmail {
            id: id.to_string(),
            from: from.to_string(),
            subject: subject.to_string(),
            received_at,
            text: text.map(str::to_string),
            is_read: false,
            raw_source,
            forged_raw_envelope: None,
        });
    }

    /// Add an email whose raw-source envelope is signed with
    /// `wrong_signing_key` instead of the inbox's real server signing
    /// key, simulating a spliced-in message from a different sender.
    pub fn add_mitm_email(&self, email_address: &str, id: &str, wrong_signing_key: Vec<u8>) {
        let envelope = EncryptedEnvelope {
            ciphertext: vec![0u8; 16],
            nonce: vec![0u8; 12],
            kem_ciphertext: vec![0u8; 1088],
            signature: vec![0u8; 64],
            sender_signing_public_key: wrong_signing_key,
        };

        let mut state = self.state.lock().unwrap();
        let inbox = state
            .inboxes
            .get_mut(email_address)
            .expect("seed_inbox must be called before add_mitm_email");
        inbox.emails.push(StoredEmail {
            id: id.to_string(),
            from: String::new(),
            subject: String::new(),
            received_at: Utc::now(),
            text: None,
            is_read: false,
            raw_source: Vec::new(),
            forged_raw_envelope: Some(envelope),
        });
    }

    /// Emit a push event for an email already added via `add_email`.
    pub fn push_event(&self, inbox_hash: &str, email_id: &str) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = &state.event_tx {
            let _ = tx.send(StreamEvent {
                inbox_hash: inbox_hash.to_string(),
                email_id: email_id.to_string(),
            });
        }
    }

    /// End the currently open event stream, simulating a dropped
    /// connection. The push strategy reconnects on its own.
    pub fn disconnect_stream(&self) {
        self.state.lock().unwrap().event_tx = None;
    }

    /// Make every future `open_event_stream` call hang forever instead
    /// of connecting, to exercise the auto-fallback-to-poll path.
    pub fn set_push_hangs(&self, hangs: bool) {
        self.state.lock().unwrap().push_hangs = hangs;
    }

    pub fn connect_count(&self) -> u64 {
        self.state.lock().unwrap().connect_count
    }
}

#[async_trait]
impl GatewayTransport for FakeGatewayTransport {
    async fn check_key(&self) -> Result<()> {
        Ok(())
    }

    async fn get_server_info(&self) -> Result<ServerInfo> {
        Ok(ServerInfo {
            allowed_domains: vec!["gateway.test".to_string()],
            max_ttl_secs: 3600,
            default_ttl_secs: 600,
        })
    }

    async fn create_inbox(&self, opts: CreateInboxOptions) -> Result<CreateInboxResult> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let email_address = opts
            .email_address
            .unwrap_or_else(|| format!("inbox-{n}@gateway.test"));
        let encrypted = opts.kem_public_key.is_some();

        self.state
            .lock()
            .unwrap()
            .inboxes
            .insert(email_address.clone(), FakeInbox { emails: Vec::new() });

        let ttl = i64::try_from(opts.ttl_secs.unwrap_or(600)).unwrap_or(i64::MAX);
        Ok(CreateInboxResult {
            email_address,
            expires_at: Utc::now() + chrono::Duration::seconds(ttl),
            inbox_hash: format!("hash-{n}"),
            server_signing_public_key: None,
            encrypted,
            email_auth: false,
        })
    }

    async fn get_inbox_sync(&self, email_address: &str) -> Result<InboxSyncResult> {
        let state = self.state.lock().unwrap();
        let inbox = state
            .inboxes
            .get(email_address)
            .ok_or_else(|| Error::InboxNotFound(email_address.to_string()))?;
        Ok(InboxSyncResult {
            emails_hash: compute_hash(inbox.emails.iter().map(|e| e.id.as_str())),
            email_count: inbox.emails.len() as u64,
        })
    }

    async fn get_emails(&self, email_address: &str, _include_content: bool) -> Result<Vec<EmailMetadata>> {
        let state = self.state.lock().unwrap();
        let inbox = state
            .inboxes
            .get(email_address)
            .ok_or_else(|| Error::InboxNotFound(email_address.to_string()))?;
        Ok(inbox
            .emails
            .iter()
            .map(|e| EmailMetadata {
                id: e.id.clone(),
                from: e.from.clone(),
                subject: e.subject.clone(),
                received_at: e.received_at,
                is_read: e.is_read,
            })
            .collect())
    }

    async fn get_email(&self, email_address: &str, email_id: &str) -> Result<RawEmailRecord> {
        let state = self.state.lock().unwrap();
        let inbox = state
            .inboxes
            .get(email_address)
            .ok_or_else(|| Error::InboxNotFound(email_address.to_string()))?;
        let email = inbox
            .emails
            .iter()
            .find(|e| e.id == email_id)
            .ok_or_else(|| Error::EmailNotFound(email_id.to_string()))?;

        Ok(RawEmailRecord {
            id: email.id.clone(),
            received_at: email.received_at,
            from: Some(email.from.clone()),
            to: Some(vec![email_address.to_string()]),
            subject: Some(email.subject.clone()),
            text: email.text.clone(),
            html: None,
            headers: None,
            attachments: None,
            links: None,
            auth_results: None,
            spam_analysis: None,
            metadata_envelope: None,
            content_envelope: None,
        })
    }

    async fn get_email_raw(&self, email_address: &str, email_id: &str) -> Result<RawEmailSource> {
        let state = self.state.lock().unwrap();
        let inbox = state
            .inboxes
            .get(email_address)
            .ok_or_else(|| Error::InboxNotFound(email_address.to_string()))?;
        let email = inbox
            .emails
            .iter()
            .find(|e| e.id == email_id)
            .ok_or_else(|| Error::EmailNotFound(email_id.to_string()))?;

        if let Some(envelope) = &email.forged_raw_envelope {
            return Ok(RawEmailSource {
                source: None,
                envelope: Some(envelope.clone()),
            });
        }
        Ok(RawEmailSource {
            source: Some(URL_SAFE_NO_PAD.encode(&email.raw_source)),
            envelope: None,
        })
    }

    async fn delete_inbox_by_email(&self, email_address: &str) -> Result<()> {
        self.state.lock().unwrap().inboxes.remove(email_address);
        Ok(())
    }

    async fn delete_all_inboxes(&self) -> Result<()> {
        self.state.lock().unwrap().inboxes.clear();
        Ok(())
    }

    async fn mark_email_as_read(&self, email_address: &str, email_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(inbox) = state.inboxes.get_mut(email_address) {
            if let Some(email) = inbox.emails.iter_mut().find(|e| e.id == email_id) {
                email.is_read = true;
            }
        }
        Ok(())
    }

    async fn delete_email(&self, email_address: &str, email_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(inbox) = state.inboxes.get_mut(email_address) {
            inbox.emails.retain(|e| e.id != email_id);
        }
        Ok(())
    }

    async fn open_event_stream(&self, _initial_inbox_hashes: Vec<String>) -> Result<EventStream> {
        let hangs = {
            let mut state = self.state.lock().unwrap();
            state.connect_count += 1;
            state.push_hangs
        };
        if hangs {
            std::future::pending::<()>().await;
            unreachable!("push_hangs never resolves");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().event_tx = Some(tx);

        let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (Ok(event), rx)) });
        Ok(Box::pin(stream))
    }
}

/// Build an [`ExportedInbox`] fixture for a plain (unencrypted) inbox,
/// for use with `Client::import_inbox`.
#[must_use]
pub fn exported_plain_inbox(email_address: &str, inbox_hash: &str) -> ExportedInbox {
    ExportedInbox {
        version: 1,
        email_address: email_address.to_string(),
        expires_at: Utc::now() + chrono::Duration::hours(1),
        inbox_hash: inbox_hash.to_string(),
        server_sig_pk: None,
        secret_key: None,
        exported_at: Utc::now(),
        encrypted: false,
        email_auth: false,
    }
}

/// Build an [`ExportedInbox`] fixture for an encrypted inbox, for use
/// with `Client::import_inbox`.
#[must_use]
pub fn exported_encrypted_inbox(
    email_address: &str,
    inbox_hash: &str,
    keypair: &Keypair,
    server_signing_public_key: &[u8],
) -> ExportedInbox {
    ExportedInbox {
        version: 1,
        email_address: email_address.to_string(),
        expires_at: Utc::now() + chrono::Duration::hours(1),
        inbox_hash: inbox_hash.to_string(),
        server_sig_pk: Some(URL_SAFE_NO_PAD.encode(server_signing_public_key)),
        secret_key: Some(URL_SAFE_NO_PAD.encode(&keypair.secret_key)),
        exported_at: Utc::now(),
        encrypted: true,
        email_auth: false,
    }
}
