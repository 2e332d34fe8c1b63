//! Cipher envelope serialization.
//!
//! An envelope is the persisted form of one encryption:
//!
//! ```text
//! enc::<base64( {"v":1,"keyId":"...","iv":"<b64>","authTag":"<b64>","cipherText":"<b64>"} )>
//! ```
//!
//! The fixed `enc::` prefix is what separates an encrypted value from an
//! ordinary plaintext string. A string without the prefix is not an error:
//! it is a value that has not been migrated yet. A string *with* the prefix
//! that fails to parse is corruption and fails closed.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::crypto::{CipherParts, NONCE_LEN, TAG_LEN};
use crate::error::{Result, VaultError};

/// Marks a string as a serialized envelope.
pub const ENCRYPTION_PREFIX: &str = "enc::";

/// The only envelope format this build reads or writes.
pub const ENVELOPE_VERSION: u32 = 1;

/// A parsed envelope: the cipher parts plus the id of the key that sealed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: u32,
    pub key_id: String,
    pub parts: CipherParts,
}

/// JSON shape of the envelope body. Field names are part of the persisted
/// format and must not change.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    v: u32,
    #[serde(rename = "keyId", default)]
    key_id: String,
    #[serde(default)]
    iv: String,
    #[serde(rename = "authTag", default)]
    auth_tag: String,
    #[serde(rename = "cipherText", default)]
    cipher_text: String,
}

fn corrupt(reason: &str) -> VaultError {
    VaultError::IntegrityViolation(format!("malformed envelope: {reason}"))
}

impl Envelope {
    /// Build a current-version envelope for `parts` sealed under `key_id`.
    pub fn seal(key_id: impl Into<String>, parts: CipherParts) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            key_id: key_id.into(),
            parts,
        }
    }

    /// Serialize into the prefixed, base64-encoded JSON form.
    pub fn serialize(&self) -> Result<String> {
        let wire = WireEnvelope {
            v: self.version,
            key_id: self.key_id.clone(),
            iv: STANDARD.encode(self.parts.iv),
            auth_tag: STANDARD.encode(self.parts.auth_tag),
            cipher_text: STANDARD.encode(&self.parts.cipher_text),
        };
        let json = serde_json::to_string(&wire).map_err(|_| VaultError::EncryptionFailure)?;
        Ok(format!("{ENCRYPTION_PREFIX}{}", STANDARD.encode(json)))
    }

    /// Parse a stored string.
    ///
    /// Returns `Ok(None)` when the prefix is absent (legacy plaintext).
    /// Returns `IntegrityViolation` or `UnsupportedEnvelopeVersion` when the
    /// prefix is present but the body cannot be trusted.
    pub fn deserialize(value: &str) -> Result<Option<Self>> {
        let Some(body) = value.strip_prefix(ENCRYPTION_PREFIX) else {
            return Ok(None);
        };

        let json = STANDARD.decode(body).map_err(|_| corrupt("body is not base64"))?;
        let wire: WireEnvelope =
            serde_json::from_slice(&json).map_err(|_| corrupt("body is not an envelope object"))?;

        if wire.v != ENVELOPE_VERSION {
            return Err(VaultError::UnsupportedEnvelopeVersion(wire.v));
        }
        // An empty cipherText is legal: it is the encryption of an empty value.
        if wire.key_id.is_empty() || wire.iv.is_empty() || wire.auth_tag.is_empty() {
            return Err(corrupt("missing field"));
        }

        let iv: [u8; NONCE_LEN] = decode_field(&wire.iv, "iv")?
            .try_into()
            .map_err(|_| corrupt("iv length"))?;
        let auth_tag: [u8; TAG_LEN] = decode_field(&wire.auth_tag, "authTag")?
            .try_into()
            .map_err(|_| corrupt("authTag length"))?;
        let cipher_text = decode_field(&wire.cipher_text, "cipherText")?;

        Ok(Some(Self {
            version: wire.v,
            key_id: wire.key_id,
            parts: CipherParts {
                iv,
                auth_tag,
                cipher_text,
            },
        }))
    }
}

fn decode_field(value: &str, name: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|_| corrupt(&format!("{name} is not base64")))
}

/// A value read from a field that may or may not have been migrated to
/// encryption yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    Plaintext(String),
    Encrypted(Envelope),
}

impl StoredValue {
    /// The single tag dispatch between legacy plaintext and envelopes.
    pub fn decode(value: &str) -> Result<Self> {
        Ok(match Envelope::deserialize(value)? {
            Some(envelope) => Self::Encrypted(envelope),
            None => Self::Plaintext(value.to_string()),
        })
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }
}
