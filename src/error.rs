//! Error taxonomy for gateway-client
//!
//! Kinds, not types: usage errors (caller misused the API), API errors
//! (the gateway answered with a meaningful HTTP status), network
//! errors (the transport itself failed), crypto errors (the envelope
//! pipeline in [`crate::crypto`] rejected something), and validation
//! errors (malformed import/export data). No panic escapes the
//! library; every fallible path returns a [`Result`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // -- Usage --
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("client is closed")]
    ClientClosed,

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("count must be >= 0, got {0}")]
    NegativeCount(i64),

    // -- API (HTTP-status-bearing) --
    #[error("unauthorized")]
    Unauthorized,

    #[error("inbox not found: {0}")]
    InboxNotFound(String),

    #[error("email not found: {0}")]
    EmailNotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("gateway error ({status}): {message}")]
    Api { status: u16, message: String },

    // -- Network --
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("event stream error: {0}")]
    Stream(String),

    // -- Crypto --
    #[error("signature invalid (key mismatch: {key_mismatch})")]
    SignatureInvalid { key_mismatch: bool },

    #[error("decryption failed")]
    DecryptionFailed,

    // -- Validation --
    #[error("invalid import data: {0}")]
    InvalidImportData(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Cancellation --
    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// True for the crypto-kind errors the core never recovers from;
    /// callers should treat these as terminal for the affected email.
    #[must_use]
    pub const fn is_crypto(&self) -> bool {
        matches!(
            self,
            Self::SignatureInvalid { .. } | Self::DecryptionFailed
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
