//! The caller-facing store/reveal protocol.
//!
//! Domain code never handles keys. It hands a value to the vault, gets back
//! a record whose pointer (`vault:<id>`) it keeps in place of the value, and
//! later trades the pointer back for the plaintext.
//!
//! Items are immutable. Changing a value means storing a new item and
//! deleting the old pointer in the same domain transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditLog, AuditRecord, AuditSink};
use crate::crypto;
use crate::envelope::{Envelope, StoredValue};
use crate::error::{Result, VaultError};
use crate::keys::{ActiveKey, KeyStore, MasterKey};
use crate::store::{KeyRecordStore, VaultItemStore};

/// Prefix of every vault pointer.
pub const POINTER_PREFIX: &str = "vault:";

/// Persisted form of one stored secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultItemRecord {
    pub id: String,
    /// The domain record this secret belongs to, e.g. a report id.
    pub owner_id: String,
    /// Logical field name, e.g. `reportAttachment.storageKey`.
    pub field: String,
    /// The data key that sealed `cipher_text`.
    pub key_id: String,
    /// Serialized envelope.
    pub cipher_text: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl VaultItemRecord {
    /// The pointer callers store in place of the value.
    pub fn pointer(&self) -> String {
        build_pointer(&self.id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Options accepted by the store operations.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pub expires_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Pointer convention
// ---------------------------------------------------------------------------

pub fn build_pointer(id: &str) -> String {
    format!("{POINTER_PREFIX}{id}")
}

/// The item id carried by `pointer`, or `None` if it is not a pointer.
pub fn extract_id(pointer: &str) -> Option<&str> {
    let id = pointer.strip_prefix(POINTER_PREFIX)?;
    let valid = !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    valid.then_some(id)
}

/// Total: returns false for any string that is not a well-formed pointer.
pub fn is_pointer(value: &str) -> bool {
    extract_id(value).is_some()
}

/// A domain field that may hold either a vault pointer or a value written
/// before the field was migrated to the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue<'a> {
    /// Carries the vault item id.
    Pointer(&'a str),
    Plaintext(&'a str),
}

impl<'a> FieldValue<'a> {
    pub fn classify(value: &'a str) -> Self {
        match extract_id(value) {
            Some(id) => Self::Pointer(id),
            None => Self::Plaintext(value),
        }
    }
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// Stores and reveals secrets through a shared [`KeyStore`].
#[derive(Debug)]
pub struct Vault<S> {
    keys: Arc<KeyStore<S>>,
    store: Arc<S>,
    audit: Mutex<AuditLog>,
}

impl<S: KeyRecordStore + VaultItemStore> Vault<S> {
    /// Build a vault on an existing key store. `store` must be the same
    /// backend the key store writes to.
    pub fn new(keys: Arc<KeyStore<S>>, store: Arc<S>) -> Self {
        Self {
            keys,
            store,
            audit: Mutex::new(AuditLog::new()),
        }
    }

    /// Build the key store and the vault in one step.
    pub fn with_master_key(master: MasterKey, store: Arc<S>) -> Self {
        let keys = Arc::new(KeyStore::new(master, Arc::clone(&store)));
        Self::new(keys, store)
    }

    pub fn key_store(&self) -> &Arc<KeyStore<S>> {
        &self.keys
    }

    pub fn add_audit_sink(&self, sink: Box<dyn AuditSink>) {
        self.audit.lock().add_forward_sink(sink);
    }

    /// The in-memory audit log. It keeps the most recent records only; see
    /// [`AuditLog::set_retention`] and [`AuditLog::drain`].
    pub fn audit_log(&self) -> MutexGuard<'_, AuditLog> {
        self.audit.lock()
    }

    /// Encrypt `value` under the active data key and persist it.
    pub fn store_bytes(
        &self,
        owner_id: &str,
        field: &str,
        value: &[u8],
        options: StoreOptions,
    ) -> Result<VaultItemRecord> {
        let key = self.keys.get_active_key()?;
        let parts = crypto::encrypt(key.secret.as_bytes(), value)?;
        let cipher_text = Envelope::seal(key.id(), parts).serialize()?;

        let item = VaultItemRecord {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            field: field.to_string(),
            key_id: key.id().to_string(),
            cipher_text,
            expires_at: options.expires_at,
            created_at: Utc::now(),
        };
        self.store.insert_item(item.clone())?;

        debug!(item_id = %item.id, owner_id, field, key_id = %item.key_id, "stored vault item");
        self.audit.lock().append(
            AuditRecord::new(AuditAction::Store)
                .item(&item.id)
                .owner(owner_id, field)
                .key(&item.key_id),
        );
        Ok(item)
    }

    pub fn store_string(
        &self,
        owner_id: &str,
        field: &str,
        value: &str,
        options: StoreOptions,
    ) -> Result<VaultItemRecord> {
        self.store_bytes(owner_id, field, value.as_bytes(), options)
    }

    /// Serialize `value` to JSON, then store it as a string.
    pub fn store_json<T: Serialize + ?Sized>(
        &self,
        owner_id: &str,
        field: &str,
        value: &T,
        options: StoreOptions,
    ) -> Result<VaultItemRecord> {
        let serialized = serde_json::to_string(value).map_err(|e| VaultError::Encode(e.to_string()))?;
        self.store_string(owner_id, field, &serialized, options)
    }

    /// Trade a pointer for the plaintext bytes.
    ///
    /// The item is decrypted with the key recorded on the item, which need
    /// not be the active key.
    pub fn reveal(&self, pointer: &str) -> Result<Vec<u8>> {
        let id = extract_id(pointer).ok_or(VaultError::NotAPointer)?;
        let item = self
            .store
            .find_item(id)?
            .ok_or_else(|| VaultError::ItemNotFound(id.to_string()))?;

        let plain = self.open_item(&item).map_err(|err| {
            error!(item_id = %item.id, key_id = %item.key_id, error = %err, "vault item cannot be revealed");
            err
        })?;

        self.audit.lock().append(
            AuditRecord::new(AuditAction::Reveal)
                .item(&item.id)
                .owner(&item.owner_id, &item.field)
                .key(&item.key_id),
        );
        Ok(plain)
    }

    pub fn reveal_string(&self, pointer: &str) -> Result<String> {
        String::from_utf8(self.reveal(pointer)?)
            .map_err(|_| VaultError::Decode("revealed value is not UTF-8".into()))
    }

    pub fn reveal_json<T: DeserializeOwned>(&self, pointer: &str) -> Result<T> {
        let content = self.reveal_string(pointer)?;
        serde_json::from_str(&content).map_err(|e| VaultError::Decode(e.to_string()))
    }

    /// Plaintext of a field that may hold a pointer or a legacy value.
    /// Pointers are revealed; anything else is returned unchanged.
    pub fn resolve_field(&self, value: &str) -> Result<String> {
        match FieldValue::classify(value) {
            FieldValue::Pointer(_) => self.reveal_string(value),
            FieldValue::Plaintext(plain) => Ok(plain.to_string()),
        }
    }

    /// Delete the item behind `pointer`. Non-pointers and missing items are
    /// ignored, so this is safe to call on any stored field value.
    pub fn delete_pointer(&self, pointer: &str) -> Result<()> {
        match extract_id(pointer) {
            Some(id) => self.delete_by_id(id),
            None => Ok(()),
        }
    }

    pub fn delete_by_id(&self, id: &str) -> Result<()> {
        if self.store.delete_item(id)? {
            debug!(item_id = id, "deleted vault item");
            self.audit
                .lock()
                .append(AuditRecord::new(AuditAction::Delete).item(id));
        }
        Ok(())
    }

    /// Cascade: remove every item belonging to `owner_id`.
    pub fn delete_owner(&self, owner_id: &str) -> Result<usize> {
        let removed = self.store.delete_owner_items(owner_id)?;
        if removed > 0 {
            debug!(owner_id, removed, "deleted vault items of owner");
            let mut record = AuditRecord::new(AuditAction::Delete);
            record.owner_id = Some(owner_id.to_string());
            self.audit.lock().append(record);
        }
        Ok(removed)
    }

    /// Remove items whose expiry has passed.
    pub fn purge_expired(&self) -> Result<usize> {
        let removed = self.store.purge_expired(Utc::now())?;
        if removed > 0 {
            info!(removed, "purged expired vault items");
        }
        Ok(removed)
    }

    pub fn items_for_owner(&self, owner_id: &str) -> Result<Vec<VaultItemRecord>> {
        self.store.list_owner_items(owner_id)
    }

    /// Rotate the active data key. Existing items stay readable.
    pub fn rotate_key(&self, label: Option<&str>) -> Result<ActiveKey> {
        let key = self.keys.rotate_active_key(label)?;
        self.audit
            .lock()
            .append(AuditRecord::new(AuditAction::RotateKey).key(key.id()));
        Ok(key)
    }

    fn open_item(&self, item: &VaultItemRecord) -> Result<Vec<u8>> {
        let envelope = match StoredValue::decode(&item.cipher_text)? {
            StoredValue::Encrypted(envelope) => envelope,
            StoredValue::Plaintext(_) => {
                return Err(VaultError::IntegrityViolation(
                    "vault item does not hold an envelope".into(),
                ))
            }
        };
        if envelope.key_id != item.key_id {
            return Err(VaultError::IntegrityViolation(
                "envelope key id does not match vault item".into(),
            ));
        }

        let key = self.keys.get_key_by_id(&item.key_id)?;
        crypto::decrypt(key.secret.as_bytes(), &envelope.parts)
    }
}
