//! Error types for reportvault.
//!
//! Every error variant is a distinct failure mode of the vault. Messages
//! signal *what* failed without revealing key material or plaintext.
//!
//! The variants split into two families. "Absent" failures (`NotAPointer`,
//! `ItemNotFound`, `KeyNotFound`) mean there is nothing to decrypt. Integrity
//! failures (`IntegrityViolation`, `UnsupportedEnvelopeVersion`,
//! `KeyIntegrity`) mean something is present but cannot be trusted, which
//! points at corruption or a master key from the wrong deployment. Callers
//! must never treat the second family as "field is empty".

use thiserror::Error;

/// The single error type for all reportvault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// A key was invalid (wrong length, malformed).
    #[error("invalid key")]
    InvalidKey,

    /// The underlying AEAD seal operation failed.
    #[error("encryption failed")]
    EncryptionFailure,

    /// The system's random number generator failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// Authentication tag mismatch, malformed envelope, or inconsistent
    /// record. Never accompanied by partial plaintext.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// An envelope carried the encryption prefix but a version this build
    /// does not understand.
    #[error("unsupported envelope version: {0}")]
    UnsupportedEnvelopeVersion(u32),

    /// A wrapped data key could not be unwrapped into exactly 32 bytes with
    /// the configured master key.
    #[error("data key integrity failure: {0}")]
    KeyIntegrity(String),

    /// A vault item references a data key that has no record.
    #[error("data key not found: {0}")]
    KeyNotFound(String),

    /// The value handed to a reveal operation is not a vault pointer.
    #[error("value is not a vault pointer")]
    NotAPointer,

    /// The pointer is well-formed but no vault item backs it.
    #[error("vault item not found: {0}")]
    ItemNotFound(String),

    /// An authentic plaintext could not be decoded as UTF-8 or JSON.
    #[error("decode failed: {0}")]
    Decode(String),

    /// A value could not be serialized before encryption.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The backing record store failed.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Configuration is missing or invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl VaultError {
    /// Returns true for failures that mean "a value is present but cannot be
    /// trusted". These should reach an operator-visible log.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::IntegrityViolation(_)
                | Self::UnsupportedEnvelopeVersion(_)
                | Self::KeyIntegrity(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VaultError>;

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for VaultError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
