//! Inbox identity, keypair ownership, and export/import (C9, §4.9)

use crate::crypto::{self, KEM_PUBLIC_KEY_LEN, KEM_SECRET_KEY_LEN, SIGNING_KEY_LEN};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};

/// A KEM keypair exclusively owned by one [`Inbox`].
#[derive(Debug, Clone)]
pub struct Keypair {
    pub secret_key: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl Keypair {
    #[must_use]
    pub fn generate() -> Self {
        let (secret_key, public_key) = crypto::generate_keypair();
        Self {
            secret_key,
            public_key,
        }
    }

    fn from_secret_key(secret_key: Vec<u8>) -> Result<Self> {
        let public_key = crypto::derive_kem_public_key(&secret_key)?;
        Ok(Self {
            secret_key,
            public_key,
        })
    }
}

/// A temporary inbox (§3).
#[derive(Debug, Clone)]
pub struct Inbox {
    pub email_address: String,
    pub inbox_hash: String,
    pub expires_at: DateTime<Utc>,
    pub encrypted: bool,
    pub email_auth: bool,
    pub keypair: Option<Keypair>,
    pub server_signing_public_key: Option<Vec<u8>>,
}

impl Inbox {
    /// Validates the invariant from §3: encrypted inboxes must carry
    /// a well-formed keypair and server signing key.
    pub fn validate(&self) -> Result<()> {
        if !self.encrypted {
            return Ok(());
        }
        let keypair = self
            .keypair
            .as_ref()
            .ok_or_else(|| Error::InvalidImportData("encrypted inbox missing keypair".into()))?;
        if keypair.secret_key.len() != KEM_SECRET_KEY_LEN {
            return Err(Error::InvalidImportData(format!(
                "KEM secret key must be {KEM_SECRET_KEY_LEN} bytes"
            )));
        }
        if keypair.public_key.len() != KEM_PUBLIC_KEY_LEN {
            return Err(Error::InvalidImportData(format!(
                "KEM public key must be {KEM_PUBLIC_KEY_LEN} bytes"
            )));
        }
        let server_pk = self.server_signing_public_key.as_ref().ok_or_else(|| {
            Error::InvalidImportData("encrypted inbox missing server signing public key".into())
        })?;
        if server_pk.len() != SIGNING_KEY_LEN {
            return Err(Error::InvalidImportData(format!(
                "server signing public key must be {SIGNING_KEY_LEN} bytes"
            )));
        }
        Ok(())
    }

    /// Export this inbox's identity and key material (§4.9). Plain
    /// inboxes omit key material entirely.
    #[must_use]
    pub fn export(&self, exported_at: DateTime<Utc>) -> ExportedInbox {
        let (server_sig_pk, secret_key) = if self.encrypted {
            (
                self.server_signing_public_key
                    .as_ref()
                    .map(|k| crate::b64::encode(k)),
                self.keypair.as_ref().map(|k| crate::b64::encode(&k.secret_key)),
            )
        } else {
            (None, None)
        };

        ExportedInbox {
            version: 1,
            email_address: self.email_address.clone(),
            expires_at: self.expires_at,
            inbox_hash: self.inbox_hash.clone(),
            server_sig_pk,
            secret_key,
            exported_at,
            encrypted: self.encrypted,
            email_auth: self.email_auth,
        }
    }
}

/// The wire/file format produced by [`Inbox::export`] (§6).
///
/// Old field names `publicKeyB64` / `secretKeyB64` must never appear;
/// this type only ever (de)serializes the current field set.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExportedInbox {
    pub version: u32,
    #[serde(rename = "emailAddress")]
    pub email_address: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
    #[serde(rename = "inboxHash")]
    pub inbox_hash: String,
    #[serde(rename = "serverSigPk", skip_serializing_if = "Option::is_none")]
    pub server_sig_pk: Option<String>,
    #[serde(rename = "secretKey", skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(rename = "exportedAt")]
    pub exported_at: DateTime<Utc>,
    pub encrypted: bool,
    #[serde(rename = "emailAuth")]
    pub email_auth: bool,
}

impl ExportedInbox {
    /// Validate and reconstruct an [`Inbox`] from export data (§4.9,
    /// §6). Does not contact the gateway; callers must separately
    /// confirm the inbox still exists on the server before trusting
    /// it (per §4.9, a failed existence check must leave client state
    /// unchanged, which is a caller-side concern since it requires a
    /// transport round-trip).
    pub fn into_inbox(self) -> Result<Inbox> {
        if self.version != 1 {
            return Err(Error::InvalidImportData(format!(
                "unsupported export version {}",
                self.version
            )));
        }
        if self.email_address.matches('@').count() != 1 {
            return Err(Error::InvalidImportData(
                "email address must contain exactly one '@'".into(),
            ));
        }
        if self.inbox_hash.is_empty() {
            return Err(Error::InvalidImportData("inbox hash must not be empty".into()));
        }

        let (keypair, server_signing_public_key) = if self.encrypted {
            let secret_key_b64 = self
                .secret_key
                .ok_or_else(|| Error::InvalidImportData("missing secretKey".into()))?;
            let secret_key = crate::b64::decode(&secret_key_b64)
                .map_err(|e| Error::InvalidImportData(format!("malformed secretKey: {e}")))?;
            if secret_key.len() != KEM_SECRET_KEY_LEN {
                return Err(Error::InvalidImportData(format!(
                    "secretKey must decode to {KEM_SECRET_KEY_LEN} bytes, got {}",
                    secret_key.len()
                )));
            }

            let server_sig_pk_b64 = self
                .server_sig_pk
                .ok_or_else(|| Error::InvalidImportData("missing serverSigPk".into()))?;
            let server_sig_pk = crate::b64::decode(&server_sig_pk_b64)
                .map_err(|e| Error::InvalidImportData(format!("malformed serverSigPk: {e}")))?;
            if server_sig_pk.len() != SIGNING_KEY_LEN {
                return Err(Error::InvalidImportData(format!(
                    "serverSigPk must decode to {SIGNING_KEY_LEN} bytes, got {}",
                    server_sig_pk.len()
                )));
            }

            (Some(Keypair::from_secret_key(secret_key)?), Some(server_sig_pk))
        } else {
            (None, None)
        };

        let inbox = Inbox {
            email_address: self.email_address,
            inbox_hash: self.inbox_hash,
            expires_at: self.expires_at,
            encrypted: self.encrypted,
            email_auth: self.email_auth,
            keypair,
            server_signing_public_key,
        };
        inbox.validate()?;
        Ok(inbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_encrypted_inbox() -> Inbox {
        Inbox {
            email_address: "temp@gateway.test".to_string(),
            inbox_hash: "a".repeat(32),
            expires_at: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
            encrypted: true,
            email_auth: true,
            keypair: Some(Keypair::generate()),
            server_signing_public_key: Some(vec![9u8; SIGNING_KEY_LEN]),
        }
    }

    #[test]
    fn export_omits_key_material_for_plain_inbox() {
        let mut inbox = sample_encrypted_inbox();
        inbox.encrypted = false;
        inbox.keypair = None;
        inbox.server_signing_public_key = None;

        let exported = inbox.export(Utc::now());
        assert!(exported.secret_key.is_none());
        assert!(exported.server_sig_pk.is_none());
        assert!(!exported.encrypted);
    }

    #[test]
    fn old_field_names_never_appear_on_the_wire() {
        let inbox = sample_encrypted_inbox();
        let exported = inbox.export(Utc::now());
        let json = serde_json::to_string(&exported).unwrap();
        assert!(!json.contains("publicKeyB64"));
        assert!(!json.contains("secretKeyB64"));
        assert!(json.contains("secretKey"));
        assert!(json.contains("serverSigPk"));
    }

    #[test]
    fn round_trip_export_import_preserves_decryption_capability() {
        let inbox = sample_encrypted_inbox();
        let exported = inbox.export(Utc::now());
        let imported = exported.into_inbox().unwrap();

        assert_eq!(imported.email_address, inbox.email_address);
        assert_eq!(
            imported.keypair.unwrap().secret_key,
            inbox.keypair.unwrap().secret_key
        );
    }

    #[test]
    fn wrong_version_is_rejected() {
        let inbox = sample_encrypted_inbox();
        let mut exported = inbox.export(Utc::now());
        exported.version = 2;
        assert!(exported.into_inbox().is_err());
    }

    #[test]
    fn malformed_email_address_is_rejected() {
        let inbox = sample_encrypted_inbox();
        let mut exported = inbox.export(Utc::now());
        exported.email_address = "not-an-email".to_string();
        assert!(exported.into_inbox().is_err());
    }
}
