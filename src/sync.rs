//! Per-inbox sync state, content hashing, and the reconcile algorithm
//! (C6, §4.6, §8)

use crate::crypto::{self, EnvelopeRole};
use crate::email::{filter_string_headers, Attachment, Email, EmailMetadata};
use crate::error::{Error, Result};
use crate::inbox::Inbox;
use crate::transport::{GatewayTransport, RawAttachment, RawEmailRecord, RawEmailSource};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Per-inbox dedup state (§3). `seen_emails` is kept sorted so the
/// content hash never depends on insertion order.
pub struct SyncState {
    seen_emails: Mutex<BTreeSet<String>>,
}

impl SyncState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            seen_emails: Mutex::new(BTreeSet::new()),
        }
    }

    /// Returns `true` if `id` was newly inserted (i.e. not a dup).
    pub async fn insert(&self, id: String) -> bool {
        self.seen_emails.lock().await.insert(id)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.seen_emails.lock().await.contains(id)
    }

    pub async fn remove(&self, id: &str) {
        self.seen_emails.lock().await.remove(id);
    }

    pub async fn ids(&self) -> BTreeSet<String> {
        self.seen_emails.lock().await.clone()
    }

    pub async fn hash(&self) -> String {
        compute_emails_hash(self.seen_emails.lock().await.iter())
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

/// `base64url_unpadded(SHA-256(sorted(ids) joined by 0x00))` (§6, §8).
/// An empty set hashes to the fixed constant
/// `47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU`.
pub fn compute_emails_hash<'a, I>(ids: I) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    let mut sorted: Vec<&str> = ids.into_iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let mut buf = Vec::new();
    for (i, id) in sorted.iter().enumerate() {
        if i > 0 {
            buf.push(0u8);
        }
        buf.extend_from_slice(id.as_bytes());
    }

    crate::b64::encode(&Sha256::digest(&buf))
}

impl From<RawAttachment> for Attachment {
    fn from(raw: RawAttachment) -> Self {
        Self {
            filename: raw.filename,
            content_type: raw.content_type,
            size: raw.size,
            content: raw.content,
            content_id: raw.content_id,
            disposition: raw.disposition,
            checksum: raw.checksum,
        }
    }
}

/// Turn a possibly-encrypted wire record into a plaintext [`Email`]
/// (§4.1, §4.7). The metadata envelope supplies from/to/subject/date;
/// the content envelope (absent on metadata-only fetches) supplies
/// body/attachments/headers/links.
pub fn decode_email(inbox: &Inbox, raw: RawEmailRecord) -> Result<Email> {
    if !inbox.encrypted {
        return Ok(Email {
            id: raw.id,
            from: raw.from.unwrap_or_default(),
            to: raw.to.unwrap_or_default(),
            subject: raw.subject.unwrap_or_default(),
            text: raw.text,
            html: raw.html,
            received_at: raw.received_at,
            headers: filter_string_headers(raw.headers.unwrap_or_default()),
            attachments: raw
                .attachments
                .unwrap_or_default()
                .into_iter()
                .map(Attachment::from)
                .collect(),
            links: raw.links.unwrap_or_default(),
            auth_results: raw.auth_results,
            spam_analysis: raw.spam_analysis,
        });
    }

    let keypair = inbox
        .keypair
        .as_ref()
        .ok_or(Error::DecryptionFailed)?;
    let server_pk = inbox
        .server_signing_public_key
        .as_ref()
        .ok_or(Error::DecryptionFailed)?;

    let metadata_envelope = raw.metadata_envelope.as_ref().ok_or(Error::DecryptionFailed)?;
    let metadata_bytes = crypto::decrypt_envelope(
        metadata_envelope,
        &keypair.secret_key,
        server_pk,
        EnvelopeRole::Metadata,
    )?;
    let metadata: MetadataPayload = serde_json::from_slice(&metadata_bytes)?;

    let content: Option<ContentPayload> = match &raw.content_envelope {
        Some(envelope) => {
            let bytes = crypto::decrypt_envelope(
                envelope,
                &keypair.secret_key,
                server_pk,
                EnvelopeRole::Parsed,
            )?;
            Some(serde_json::from_slice(&bytes)?)
        }
        None => None,
    };

    Ok(Email {
        id: raw.id,
        from: metadata.from,
        to: metadata.to,
        subject: metadata.subject,
        received_at: metadata.received_at,
        text: content.as_ref().and_then(|c| c.text.clone()),
        html: content.as_ref().and_then(|c| c.html.clone()),
        headers: content
            .as_ref()
            .map(|c| filter_string_headers(c.headers.clone()))
            .unwrap_or_default(),
        attachments: content
            .as_ref()
            .map(|c| c.attachments.iter().cloned().map(Attachment::from).collect())
            .unwrap_or_default(),
        links: content.as_ref().map(|c| c.links.clone()).unwrap_or_default(),
        auth_results: content.as_ref().and_then(|c| c.auth_results.clone()),
        spam_analysis: content.and_then(|c| c.spam_analysis),
    })
}

#[derive(Debug, Clone, serde::Deserialize)]
struct MetadataPayload {
    from: String,
    #[serde(default)]
    to: Vec<String>,
    subject: String,
    #[serde(rename = "receivedAt")]
    received_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct ContentPayload {
    text: Option<String>,
    html: Option<String>,
    #[serde(default)]
    attachments: Vec<RawAttachment>,
    #[serde(default)]
    links: Vec<String>,
    #[serde(default)]
    headers: std::collections::HashMap<String, serde_json::Value>,
    #[serde(rename = "authResults", default)]
    auth_results: Option<serde_json::Value>,
    #[serde(rename = "spamAnalysis", default)]
    spam_analysis: Option<serde_json::Value>,
}

/// Decode `GetEmailRaw`'s response into RFC 5322 source bytes (§6),
/// decrypting under [`EnvelopeRole::Raw`] for encrypted inboxes.
pub fn decode_raw_email(inbox: &Inbox, raw: RawEmailSource) -> Result<Vec<u8>> {
    if !inbox.encrypted {
        let source = raw.source.ok_or(Error::DecryptionFailed)?;
        return crate::b64::decode(&source)
            .map_err(|e| Error::InvalidImportData(format!("malformed raw source: {e}")));
    }

    let keypair = inbox.keypair.as_ref().ok_or(Error::DecryptionFailed)?;
    let server_pk = inbox
        .server_signing_public_key
        .as_ref()
        .ok_or(Error::DecryptionFailed)?;
    let envelope = raw.envelope.as_ref().ok_or(Error::DecryptionFailed)?;

    crypto::decrypt_envelope(envelope, &keypair.secret_key, server_pk, EnvelopeRole::Raw)
}

/// Fetch and decrypt one email by id, shared by the registry's push
/// dispatch (§4.7) and this module's reconcile loop (§4.6).
pub async fn fetch_and_decrypt(
    inbox: &Inbox,
    transport: &dyn GatewayTransport,
    email_id: &str,
) -> Result<Email> {
    let raw = transport.get_email(&inbox.email_address, email_id).await?;
    decode_email(inbox, raw)
}

/// Callback invoked with a non-fatal error encountered while
/// reconciling or dispatching a single email; the offending email id
/// is never inserted into `seen_emails`, so the next cycle retries it
/// (§4.6 step 8, §4.7 step 6).
pub type SyncErrorCallback = Arc<dyn Fn(String, Error) + Send + Sync>;

/// Run the reconcile algorithm for one inbox (§4.6). Returns `true`
/// if any email was newly delivered or any id was dropped as removed.
pub async fn reconcile_inbox(
    inbox: &Inbox,
    sync_state: &SyncState,
    transport: &dyn GatewayTransport,
    subscriptions: &crate::subscription::SubscriptionManager,
    on_sync_error: &SyncErrorCallback,
) -> Result<bool> {
    let local_hash = sync_state.hash().await;
    let server = transport.get_inbox_sync(&inbox.email_address).await?;
    if server.emails_hash == local_hash {
        return Ok(false);
    }

    let metadata_list = transport.get_emails(&inbox.email_address, false).await?;
    let server_ids: BTreeSet<String> = metadata_list.iter().map(|m| m.id.clone()).collect();
    let seen = sync_state.ids().await;

    let added_ids: BTreeSet<&String> = server_ids.difference(&seen).collect();
    let removed_ids: Vec<&String> = seen.difference(&server_ids).collect();

    let mut added_meta: Vec<&EmailMetadata> = metadata_list
        .iter()
        .filter(|m| added_ids.contains(&m.id))
        .collect();
    added_meta.sort_by(|a, b| a.received_at.cmp(&b.received_at).then_with(|| a.id.cmp(&b.id)));

    let mut changed = false;

    for meta in added_meta {
        match fetch_and_decrypt(inbox, transport, &meta.id).await {
            Ok(email) => {
                if sync_state.insert(email.id.clone()).await {
                    subscriptions.notify(&inbox.inbox_hash, &email).await;
                    changed = true;
                }
            }
            Err(err) => {
                tracing::warn!(
                    inbox = %inbox.email_address,
                    email_id = %meta.id,
                    error = %err,
                    "sync fetch/decrypt failed, will retry next cycle"
                );
                on_sync_error(meta.id.clone(), err);
            }
        }
    }

    for id in removed_ids {
        sync_state.remove(id).await;
        changed = true;
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_hashes_to_spec_constant() {
        let empty: Vec<String> = Vec::new();
        assert_eq!(
            compute_emails_hash(empty.iter()),
            "47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU"
        );
    }

    #[test]
    fn hash_is_invariant_under_insertion_order() {
        let a = vec!["id-3".to_string(), "id-1".to_string(), "id-2".to_string()];
        let b = vec!["id-1".to_string(), "id-2".to_string(), "id-3".to_string()];
        assert_eq!(compute_emails_hash(a.iter()), compute_emails_hash(b.iter()));
    }

    #[test]
    fn hash_changes_when_set_changes() {
        let a = vec!["id-1".to_string()];
        let b = vec!["id-1".to_string(), "id-2".to_string()];
        assert_ne!(compute_emails_hash(a.iter()), compute_emails_hash(b.iter()));
    }

    #[tokio::test]
    async fn sync_state_insert_is_dedup_aware() {
        let state = SyncState::new();
        assert!(state.insert("a".to_string()).await);
        assert!(!state.insert("a".to_string()).await);
        assert_eq!(state.ids().await.len(), 1);
    }
}
