//! Email data model (§3)
//!
//! `Email` and `EmailMetadata` are the core's public, decrypted view
//! of a message. Wire-shape (possibly-encrypted) records live in
//! [`crate::transport`] and [`crate::crypto`]; this module only knows
//! about plaintext.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    #[serde(with = "crate::b64::bytes")]
    pub content: Vec<u8>,
    pub content_id: Option<String>,
    pub disposition: Option<String>,
    pub checksum: String,
}

/// A fully decrypted (or, for plain inboxes, as-received) email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Email {
    pub id: String,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub received_at: DateTime<Utc>,
    /// Non-string header values are dropped during parsing (§3).
    pub headers: HashMap<String, String>,
    pub attachments: Vec<Attachment>,
    pub links: Vec<String>,
    pub auth_results: Option<serde_json::Value>,
    pub spam_analysis: Option<serde_json::Value>,
}

/// Subset of [`Email`] used by the sync engine to avoid full-content
/// fetches (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMetadata {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
}

/// Keep only header values that arrived as JSON strings; non-string
/// values are dropped per the data-model invariant in §3.
#[must_use]
pub fn filter_string_headers(raw: HashMap<String, serde_json::Value>) -> HashMap<String, String> {
    raw.into_iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
        .collect()
}
