//! base64url (unpadded) helpers
//!
//! Every identifier and key the gateway exchanges over the wire uses
//! unpadded base64url, including the sync hash (§8: the empty set
//! hashes to a fixed, known string). Centralizing encode and decode
//! here keeps the wire format bit-exact across [`crate::crypto`],
//! [`crate::sync`], and [`crate::inbox`].

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn decode(s: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(s)
}

/// `serde(with = "crate::b64::bytes")` for `Vec<u8>` fields carried as
/// base64url strings on the wire (envelope fields in §6).
pub mod bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&super::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        super::decode(&s).map_err(serde::de::Error::custom)
    }
}
