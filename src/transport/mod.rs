//! External transport boundary (§6)
//!
//! Everything in this module is a black box from the core's point of
//! view: HTTP retries, status-code mapping, and concrete endpoint
//! shapes live behind [`GatewayTransport`]. [`HttpGatewayTransport`]
//! is the default production implementation; tests supply a fake one
//! to drive the delivery core deterministically.

mod http;

pub use http::HttpGatewayTransport;

use crate::crypto::EncryptedEnvelope;
use crate::email::EmailMetadata;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub allowed_domains: Vec<String>,
    pub max_ttl_secs: u64,
    pub default_ttl_secs: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CreateInboxOptions {
    pub ttl_secs: Option<u64>,
    pub email_address: Option<String>,
    /// Present when the caller wants an encrypted inbox; the core
    /// generates this keypair locally (§4.9: "each Inbox exclusively
    /// owns its keypair") and only ships the public half.
    pub kem_public_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInboxResult {
    pub email_address: String,
    pub expires_at: DateTime<Utc>,
    pub inbox_hash: String,
    pub server_signing_public_key: Option<String>,
    pub encrypted: bool,
    #[serde(default)]
    pub email_auth: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboxSyncResult {
    pub emails_hash: String,
    pub email_count: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawAttachment {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    #[serde(with = "crate::b64::bytes", default)]
    pub content: Vec<u8>,
    pub content_id: Option<String>,
    pub disposition: Option<String>,
    #[serde(default)]
    pub checksum: String,
}

/// The raw wire shape of one email, as returned by `GetEmail`
/// (§6). Either the plain fields or the two envelopes are populated,
/// depending on `Inbox::encrypted` -- never both.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEmailRecord {
    pub id: String,
    pub received_at: DateTime<Utc>,

    // Plain-inbox fields.
    pub from: Option<String>,
    pub to: Option<Vec<String>>,
    pub subject: Option<String>,
    pub text: Option<String>,
    pub html: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub attachments: Option<Vec<RawAttachment>>,
    #[serde(default)]
    pub links: Option<Vec<String>>,
    #[serde(rename = "authResults", default)]
    pub auth_results: Option<serde_json::Value>,
    #[serde(rename = "spamAnalysis", default)]
    pub spam_analysis: Option<serde_json::Value>,

    // Encrypted-inbox fields.
    #[serde(rename = "metadataEnvelope", default)]
    pub metadata_envelope: Option<EncryptedEnvelope>,
    #[serde(rename = "contentEnvelope", default)]
    pub content_envelope: Option<EncryptedEnvelope>,
}

/// One line-delimited event from the push stream (§4.3, §6):
/// `{inboxId, emailId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "inboxId")]
    pub inbox_hash: String,
    #[serde(rename = "emailId")]
    pub email_id: String,
}

pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

/// RFC 5322 source as returned by `GetEmailRaw` (§6). For plain
/// inboxes `source` carries the base64url-encoded bytes directly; for
/// encrypted inboxes `envelope` carries the same bytes sealed under
/// the raw-source role (§4.1).
#[derive(Debug, Clone, Deserialize)]
pub struct RawEmailSource {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(rename = "rawEnvelope", default)]
    pub envelope: Option<EncryptedEnvelope>,
}

/// The operations the delivery core consumes from the gateway (§6).
/// All concrete REST shapes beyond this surface are out of scope.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    async fn check_key(&self) -> Result<()>;
    async fn get_server_info(&self) -> Result<ServerInfo>;
    async fn create_inbox(&self, opts: CreateInboxOptions) -> Result<CreateInboxResult>;
    async fn get_inbox_sync(&self, email_address: &str) -> Result<InboxSyncResult>;
    async fn get_emails(&self, email_address: &str, include_content: bool) -> Result<Vec<EmailMetadata>>;
    async fn get_email(&self, email_address: &str, email_id: &str) -> Result<RawEmailRecord>;
    /// RFC 5322 source, base64url-encoded (or sealed under an
    /// envelope for encrypted inboxes) (§6).
    async fn get_email_raw(&self, email_address: &str, email_id: &str) -> Result<RawEmailSource>;
    async fn delete_inbox_by_email(&self, email_address: &str) -> Result<()>;
    async fn delete_all_inboxes(&self) -> Result<()>;
    async fn mark_email_as_read(&self, email_address: &str, email_id: &str) -> Result<()>;
    async fn delete_email(&self, email_address: &str, email_id: &str) -> Result<()>;
    /// Open the long-lived push event stream (§4.3). Implementations
    /// MUST reuse the caller-supplied HTTP client -- default
    /// transports are prohibited on this path.
    async fn open_event_stream(&self, initial_inbox_hashes: Vec<String>) -> Result<EventStream>;
}
