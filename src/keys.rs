//! Key ownership and the data key lifecycle.
//!
//! This module owns two responsibilities:
//! 1. Holding key material in types that are opaque, non-cloneable, and
//!    zeroised on drop.
//! 2. The `KeyStore`: creating, wrapping, unwrapping, caching and rotating
//!    data keys. It is the only component that ever sees unwrapped data key
//!    bytes.
//!
//! ## Wrapping
//!
//! ```text
//! DataKeyRecord.wrapped_key = envelope(
//!     key_id = "master",
//!     parts  = AES-256-GCM(master_key, data_key_bytes)
//! )
//! ```
//!
//! A data key's wrapped form never changes after creation; only its `active`
//! flag does. That is why unwrapped secrets can be cached forever.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{self, KEY_LEN};
use crate::envelope::Envelope;
use crate::error::{Result, VaultError};
use crate::store::KeyRecordStore;

/// Key id embedded in every wrapped data key envelope.
pub const MASTER_KEY_ID: &str = "master";

// ---------------------------------------------------------------------------
// Master key
// ---------------------------------------------------------------------------

/// The master key. The single long-lived secret supplied by the process
/// environment; it wraps every data key and is never persisted.
///
/// - Not `Clone`. Cannot be duplicated without explicit conversion.
/// - Zeroised on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    /// Construct a `MasterKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let decoded = Zeroizing::new(hex::decode(encoded.trim()).map_err(|_| VaultError::InvalidKey)?);
        let bytes: [u8; KEY_LEN] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::InvalidKey)?;
        Ok(Self { bytes })
    }

    /// `pub(crate)`: raw bytes never leave the crate.
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// Data key
// ---------------------------------------------------------------------------

/// An unwrapped data key. Shared through `Arc` by the key cache; the bytes
/// are wiped when the last handle drops.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    bytes: [u8; KEY_LEN],
}

impl DataKey {
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(<redacted>)")
    }
}

/// Persisted form of a data key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataKeyRecord {
    pub id: String,
    pub label: String,
    /// Serialized envelope of the key bytes, sealed under the master key.
    pub wrapped_key: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
}

/// A data key record together with its unwrapped secret.
///
/// The secret is `pub(crate)`: callers outside the crate can inspect which
/// key is in use but never its bytes.
#[derive(Debug, Clone)]
pub struct ActiveKey {
    pub record: DataKeyRecord,
    pub(crate) secret: Arc<DataKey>,
}

impl ActiveKey {
    pub fn id(&self) -> &str {
        &self.record.id
    }
}

// ---------------------------------------------------------------------------
// Key store
// ---------------------------------------------------------------------------

/// Manages the data key lifecycle on top of a [`KeyRecordStore`].
///
/// Construct one per process and share it by `Arc`. It keeps two caches:
/// key id → unwrapped secret, and a single slot for the active key. Both
/// are filled on miss and only invalidated by `rotate_active_key` or
/// `reset_cache`.
pub struct KeyStore<S> {
    master: MasterKey,
    store: Arc<S>,
    secrets: RwLock<HashMap<String, Arc<DataKey>>>,
    active: RwLock<Option<ActiveKey>>,
}

impl<S> fmt::Debug for KeyStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active = self.active.read().as_ref().map(|a| a.record.id.clone());
        let cached_keys = self.secrets.read().len();
        f.debug_struct("KeyStore")
            .field("cached_keys", &cached_keys)
            .field("active", &active)
            .finish()
    }
}

impl<S: KeyRecordStore> KeyStore<S> {
    pub fn new(master: MasterKey, store: Arc<S>) -> Self {
        Self {
            master,
            store,
            secrets: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
        }
    }

    /// Return the active data key, creating the first one if none exists.
    pub fn get_active_key(&self) -> Result<ActiveKey> {
        if let Some(active) = self.active.read().as_ref() {
            return Ok(active.clone());
        }

        // Holding the slot for writing serialises misses against rotation,
        // so a lookup that started before a rotation cannot overwrite the
        // rotated key afterwards.
        let mut slot = self.active.write();
        if let Some(active) = slot.as_ref() {
            return Ok(active.clone());
        }

        let record = match self.store.find_active()? {
            Some(record) => record,
            None => {
                let (candidate, key) = self.generate_record(None)?;
                let candidate_id = candidate.id.clone();
                let record = self.store.insert_active_if_absent(candidate)?;
                if record.id == candidate_id {
                    // Our candidate won; its secret is already in hand.
                    info!(key_id = %record.id, label = %record.label, "created first data key");
                    self.secrets
                        .write()
                        .insert(record.id.clone(), Arc::new(key));
                }
                record
            }
        };

        let active = ActiveKey {
            secret: self.secret_for(&record)?,
            record,
        };
        *slot = Some(active.clone());
        Ok(active)
    }

    /// Resolve a specific, possibly retired, data key.
    pub fn get_key_by_id(&self, id: &str) -> Result<ActiveKey> {
        let record = self
            .store
            .find_key(id)?
            .ok_or_else(|| VaultError::KeyNotFound(id.to_string()))?;

        let key = ActiveKey {
            secret: self.secret_for(&record)?,
            record,
        };

        if key.record.active {
            let mut slot = self.active.write();
            // `record` was read before the slot lock, so a rotation may have
            // retired it since. Only fill an empty slot, and only with the
            // key the store still reports as active.
            if slot.is_none() {
                let still_active = self
                    .store
                    .find_active()?
                    .is_some_and(|current| current.id == key.record.id);
                if still_active {
                    *slot = Some(key.clone());
                }
            }
        }

        Ok(key)
    }

    /// Retire every active key and install a freshly generated one, as one
    /// atomic store operation.
    pub fn rotate_active_key(&self, label: Option<&str>) -> Result<ActiveKey> {
        let mut slot = self.active.write();

        let (mut record, key) = self.generate_record(label)?;
        let retired = self.store.rotate(record.clone(), Utc::now())?;
        record.active = true;

        let secret = Arc::new(key);
        self.secrets
            .write()
            .insert(record.id.clone(), Arc::clone(&secret));

        info!(
            key_id = %record.id,
            label = %record.label,
            retired = ?retired,
            "rotated active data key"
        );

        let active = ActiveKey { record, secret };
        *slot = Some(active.clone());
        Ok(active)
    }

    /// Drop both caches. The next call re-reads and re-unwraps from the store.
    pub fn reset_cache(&self) {
        let mut slot = self.active.write();
        self.secrets.write().clear();
        *slot = None;
    }

    /// Number of unwrapped secrets currently cached.
    pub fn cached_keys(&self) -> usize {
        self.secrets.read().len()
    }

    /// Every data key record, oldest first.
    pub fn list_keys(&self) -> Result<Vec<DataKeyRecord>> {
        self.store.list_keys()
    }

    fn secret_for(&self, record: &DataKeyRecord) -> Result<Arc<DataKey>> {
        if let Some(secret) = self.secrets.read().get(&record.id) {
            return Ok(Arc::clone(secret));
        }

        debug!(key_id = %record.id, "unwrapping data key");
        let secret = Arc::new(self.unwrap_key(record)?);
        let mut secrets = self.secrets.write();
        Ok(Arc::clone(
            secrets.entry(record.id.clone()).or_insert(secret),
        ))
    }

    fn generate_record(&self, label: Option<&str>) -> Result<(DataKeyRecord, DataKey)> {
        let key = DataKey {
            bytes: crypto::generate_random_key()?,
        };
        let wrapped_key = self.wrap_key(&key)?;
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let label = match label {
            Some(label) => label.to_string(),
            None => format!("key-{}-{}", now.to_rfc3339(), Uuid::new_v4()),
        };

        let record = DataKeyRecord {
            id,
            label,
            wrapped_key,
            active: true,
            created_at: now,
            rotated_at: None,
        };
        Ok((record, key))
    }

    fn wrap_key(&self, key: &DataKey) -> Result<String> {
        let parts = crypto::encrypt(self.master.as_bytes(), key.as_bytes())?;
        Envelope::seal(MASTER_KEY_ID, parts).serialize()
    }

    fn unwrap_key(&self, record: &DataKeyRecord) -> Result<DataKey> {
        let integrity = |reason: &str| VaultError::KeyIntegrity(format!("key {}: {reason}", record.id));

        let envelope = match Envelope::deserialize(&record.wrapped_key) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return Err(integrity("wrapped key is not an envelope")),
            Err(err) => return Err(integrity(&err.to_string())),
        };
        if envelope.key_id != MASTER_KEY_ID {
            return Err(integrity("wrapped under an unexpected master key id"));
        }

        let plain = Zeroizing::new(
            crypto::decrypt(self.master.as_bytes(), &envelope.parts)
                .map_err(|_| integrity("cannot unwrap with the configured master key"))?,
        );
        let bytes: [u8; KEY_LEN] = plain
            .as_slice()
            .try_into()
            .map_err(|_| integrity(&format!("unwrapped key is {} bytes", plain.len())))?;

        Ok(DataKey { bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;

    /// Commits a pending rotation right after serving a `find_key`, the way
    /// another process could between the read and the slot update.
    #[derive(Default)]
    struct RotateAfterRead {
        inner: MemoryStore,
        pending: Mutex<Option<DataKeyRecord>>,
    }

    impl KeyRecordStore for RotateAfterRead {
        fn insert_active_if_absent(&self, record: DataKeyRecord) -> Result<DataKeyRecord> {
            self.inner.insert_active_if_absent(record)
        }

        fn find_active(&self) -> Result<Option<DataKeyRecord>> {
            self.inner.find_active()
        }

        fn find_key(&self, id: &str) -> Result<Option<DataKeyRecord>> {
            let found = self.inner.find_key(id)?;
            if let Some(record) = self.pending.lock().take() {
                self.inner.rotate(record, Utc::now())?;
            }
            Ok(found)
        }

        fn rotate(&self, record: DataKeyRecord, rotated_at: DateTime<Utc>) -> Result<Vec<String>> {
            self.inner.rotate(record, rotated_at)
        }

        fn list_keys(&self) -> Result<Vec<DataKeyRecord>> {
            self.inner.list_keys()
        }
    }

    fn key_store(seed: u8) -> (KeyStore<MemoryStore>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let keys = KeyStore::new(MasterKey::from_bytes([seed; KEY_LEN]), Arc::clone(&store));
        (keys, store)
    }

    #[test]
    fn test_master_key_from_hex() {
        let hex_key = "00".repeat(KEY_LEN);
        assert_eq!(MasterKey::from_hex(&hex_key).unwrap().as_bytes(), &[0u8; KEY_LEN]);
        assert!(MasterKey::from_hex("abcd").is_err());
        assert!(MasterKey::from_hex(&"zz".repeat(KEY_LEN)).is_err());
    }

    #[test]
    fn test_first_use_creates_single_active_key() {
        let (keys, store) = key_store(1);
        let first = keys.get_active_key().unwrap();
        let again = keys.get_active_key().unwrap();

        assert_eq!(first.id(), again.id());
        assert!(first.record.active);
        assert_eq!(store.list_keys().unwrap().len(), 1);
        assert!(first.record.label.starts_with("key-"));
    }

    #[test]
    fn test_unwrap_after_cache_reset_yields_same_secret() {
        let (keys, _store) = key_store(2);
        let before = keys.get_active_key().unwrap();
        keys.reset_cache();
        assert_eq!(keys.cached_keys(), 0);

        let after = keys.get_active_key().unwrap();
        assert_eq!(before.id(), after.id());
        assert_eq!(before.secret.as_bytes(), after.secret.as_bytes());
        assert_eq!(keys.cached_keys(), 1);
    }

    #[test]
    fn test_rotation_retires_previous_key() {
        let (keys, store) = key_store(3);
        let old = keys.get_active_key().unwrap();
        let new = keys.rotate_active_key(Some("quarterly")).unwrap();

        assert_ne!(old.id(), new.id());
        assert_eq!(new.record.label, "quarterly");
        assert_eq!(keys.get_active_key().unwrap().id(), new.id());

        let retired = keys.get_key_by_id(old.id()).unwrap();
        assert!(!retired.record.active);
        assert!(retired.record.rotated_at.is_some());
        assert_eq!(retired.secret.as_bytes(), old.secret.as_bytes());
        assert_eq!(store.find_active().unwrap().unwrap().id, new.id());
    }

    #[test]
    fn test_unknown_key_id() {
        let (keys, _store) = key_store(4);
        assert!(matches!(
            keys.get_key_by_id("missing"),
            Err(VaultError::KeyNotFound(id)) if id == "missing"
        ));
    }

    #[test]
    fn test_wrong_master_key_is_key_integrity_error() {
        let (keys, store) = key_store(5);
        let active = keys.get_active_key().unwrap();

        let other = KeyStore::new(MasterKey::from_bytes([6u8; KEY_LEN]), store);
        assert!(matches!(other.get_active_key(), Err(VaultError::KeyIntegrity(_))));
        assert!(matches!(other.get_key_by_id(active.id()), Err(VaultError::KeyIntegrity(_))));
    }

    #[test]
    fn test_short_unwrapped_key_is_rejected() {
        let (keys, store) = key_store(7);
        let mut record = keys.get_active_key().unwrap().record;

        let parts = crypto::encrypt(&[7u8; KEY_LEN], &[0u8; 16]).unwrap();
        record.wrapped_key = Envelope::seal(MASTER_KEY_ID, parts).serialize().unwrap();
        store.replace_key(record.clone()).unwrap();
        keys.reset_cache();

        let err = keys.get_key_by_id(&record.id).unwrap_err();
        assert!(matches!(err, VaultError::KeyIntegrity(ref reason) if reason.contains("16 bytes")));
    }

    #[test]
    fn test_foreign_master_key_id_is_rejected() {
        let (keys, store) = key_store(8);
        let mut record = keys.get_active_key().unwrap().record;

        let parts = crypto::encrypt(&[8u8; KEY_LEN], &[0u8; KEY_LEN]).unwrap();
        record.wrapped_key = Envelope::seal("master-v2", parts).serialize().unwrap();
        store.replace_key(record.clone()).unwrap();
        keys.reset_cache();

        assert!(matches!(keys.get_key_by_id(&record.id), Err(VaultError::KeyIntegrity(_))));
    }

    #[test]
    fn test_plaintext_wrapped_key_is_rejected() {
        let (keys, store) = key_store(9);
        let mut record = keys.get_active_key().unwrap().record;
        record.wrapped_key = "0011223344".into();
        store.replace_key(record.clone()).unwrap();
        keys.reset_cache();

        assert!(matches!(keys.get_key_by_id(&record.id), Err(VaultError::KeyIntegrity(_))));
    }

    #[test]
    fn test_lookup_fills_empty_slot_with_active_key() {
        let (keys, _store) = key_store(10);
        let active = keys.get_active_key().unwrap();
        keys.reset_cache();

        keys.get_key_by_id(active.id()).unwrap();
        assert!(format!("{keys:?}").contains(active.id()));
        assert_eq!(keys.get_active_key().unwrap().id(), active.id());
    }

    #[test]
    fn test_lookup_racing_rotation_does_not_reinstate_retired_key() {
        let store = Arc::new(RotateAfterRead::default());
        let keys = KeyStore::new(MasterKey::from_bytes([11u8; KEY_LEN]), Arc::clone(&store));
        let old = keys.get_active_key().unwrap();
        keys.reset_cache();

        let (newer, _) = keys.generate_record(Some("elsewhere")).unwrap();
        *store.pending.lock() = Some(newer.clone());

        // The record read here still says active; the store no longer does.
        let fetched = keys.get_key_by_id(old.id()).unwrap();
        assert!(fetched.record.active);

        assert_eq!(keys.get_active_key().unwrap().id(), newer.id);
    }
}
