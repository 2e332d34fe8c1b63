//! Low-level cryptographic operations.
//!
//! This module is the only place in the crate that imports `ring` directly.
//! All other modules perform encryption and decryption exclusively through
//! the functions exposed here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption)
//! - **Nonce**: 96-bit (12 bytes), generated fresh per operation via `SystemRandom`
//! - **Tag**: 128-bit (16 bytes), kept separate from the ciphertext
//! - **Key size**: 256 bits (32 bytes)

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::VaultError;

/// The AEAD algorithm used throughout reportvault.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of the GCM authentication tag in bytes (128 bits).
pub const TAG_LEN: usize = 16;

/// Size of a master or data key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// The output of one AEAD encryption: nonce, tag, and ciphertext held apart
/// so they can be serialized into an envelope field by field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherParts {
    pub iv: [u8; NONCE_LEN],
    pub auth_tag: [u8; TAG_LEN],
    pub cipher_text: Vec<u8>,
}

fn fill_random(buf: &mut [u8]) -> Result<(), VaultError> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| VaultError::RandomnessFailure)
}

fn aead_key(key_bytes: &[u8; KEY_LEN]) -> Result<LessSafeKey, VaultError> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| VaultError::InvalidKey)?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt a plaintext payload using AES-256-GCM.
///
/// A fresh random nonce is drawn for every call. There is no nonce caching
/// or counter-based generation, so a nonce is never reused for a key.
pub fn encrypt(key_bytes: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<CipherParts, VaultError> {
    let key = aead_key(key_bytes)?;

    let mut iv = [0u8; NONCE_LEN];
    fill_random(&mut iv)?;

    let mut cipher_text = plaintext.to_vec();
    let tag = key
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(iv),
            Aad::empty(),
            &mut cipher_text,
        )
        .map_err(|_| VaultError::EncryptionFailure)?;

    let auth_tag: [u8; TAG_LEN] = tag
        .as_ref()
        .try_into()
        .map_err(|_| VaultError::EncryptionFailure)?;

    Ok(CipherParts {
        iv,
        auth_tag,
        cipher_text,
    })
}

/// Decrypt a payload produced by [`encrypt`].
///
/// If the key is wrong or any byte of the ciphertext or tag has been
/// altered, the GCM check fails and this returns `IntegrityViolation`. The
/// caller receives no partial plaintext.
pub fn decrypt(key_bytes: &[u8; KEY_LEN], parts: &CipherParts) -> Result<Vec<u8>, VaultError> {
    let key = aead_key(key_bytes)?;

    // `open_in_place` expects the tag appended to the ciphertext.
    let mut in_out = Vec::with_capacity(parts.cipher_text.len() + TAG_LEN);
    in_out.extend_from_slice(&parts.cipher_text);
    in_out.extend_from_slice(&parts.auth_tag);

    let plaintext = key
        .open_in_place(Nonce::assume_unique_for_key(parts.iv), Aad::empty(), &mut in_out)
        .map_err(|_| VaultError::IntegrityViolation("authentication tag mismatch".into()))?;

    Ok(plaintext.to_vec())
}

/// Generate a cryptographically secure random key.
///
/// This is the only function in the crate that produces raw key material
/// from scratch. Data keys and `generate_master_key()` both go through it.
pub fn generate_random_key() -> Result<[u8; KEY_LEN], VaultError> {
    let mut key = [0u8; KEY_LEN];
    fill_random(&mut key)?;
    Ok(key)
}
