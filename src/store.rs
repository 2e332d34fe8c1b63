//! Record store contract and the in-memory backend.
//!
//! The vault does not own persistence. It talks to whatever store the host
//! application provides through two traits: one for data key records and one
//! for vault item records. A store must make every trait method atomic with
//! respect to concurrent callers; in particular `rotate` must never let a
//! reader observe zero or two active keys.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{Result, VaultError};
use crate::keys::DataKeyRecord;
use crate::vault::VaultItemRecord;

/// Persistence for data key records. Only the `KeyStore` calls this.
pub trait KeyRecordStore: Send + Sync {
    /// Insert `record` as the active key unless an active key already
    /// exists, in which case the existing record is returned untouched.
    fn insert_active_if_absent(&self, record: DataKeyRecord) -> Result<DataKeyRecord>;

    /// The active key record, if any. When more than one is flagged active
    /// (which a correct store never allows), the most recent wins.
    fn find_active(&self) -> Result<Option<DataKeyRecord>>;

    fn find_key(&self, id: &str) -> Result<Option<DataKeyRecord>>;

    /// In one atomic step: mark every active record inactive with
    /// `rotated_at`, then insert `record` as the new active key. Returns the
    /// ids of the records it deactivated.
    fn rotate(&self, record: DataKeyRecord, rotated_at: DateTime<Utc>) -> Result<Vec<String>>;

    /// Every key record, oldest first.
    fn list_keys(&self) -> Result<Vec<DataKeyRecord>>;
}

/// Persistence for vault item records. Only the `Vault` calls this.
pub trait VaultItemStore: Send + Sync {
    fn insert_item(&self, item: VaultItemRecord) -> Result<()>;

    fn find_item(&self, id: &str) -> Result<Option<VaultItemRecord>>;

    /// Returns whether a record was removed. Deleting an absent id is not an error.
    fn delete_item(&self, id: &str) -> Result<bool>;

    /// Remove every item belonging to `owner_id`. Returns the number removed.
    fn delete_owner_items(&self, owner_id: &str) -> Result<usize>;

    /// Remove every item whose `expires_at` is at or before `now`.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    fn list_owner_items(&self, owner_id: &str) -> Result<Vec<VaultItemRecord>>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// A store that keeps both record kinds in process memory.
///
/// Each trait method holds a single lock for its whole duration, which is
/// what makes `rotate` and `insert_active_if_absent` atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keys: RwLock<Vec<DataKeyRecord>>,
    items: RwLock<HashMap<String, VaultItemRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a key record in place. Used to simulate storage corruption
    /// in tests; the vault itself never rewrites a key record.
    pub fn replace_key(&self, record: DataKeyRecord) -> Result<()> {
        let mut keys = self.keys.write();
        let slot = keys
            .iter_mut()
            .find(|k| k.id == record.id)
            .ok_or_else(|| VaultError::KeyNotFound(record.id.clone()))?;
        *slot = record;
        Ok(())
    }

    /// Overwrite a vault item in place. Test helper, like `replace_key`.
    pub fn replace_item(&self, item: VaultItemRecord) -> Result<()> {
        let mut items = self.items.write();
        if !items.contains_key(&item.id) {
            return Err(VaultError::ItemNotFound(item.id));
        }
        items.insert(item.id.clone(), item);
        Ok(())
    }
}

fn latest_active(keys: &[DataKeyRecord]) -> Option<&DataKeyRecord> {
    keys.iter().filter(|k| k.active).max_by_key(|k| k.created_at)
}

impl KeyRecordStore for MemoryStore {
    fn insert_active_if_absent(&self, record: DataKeyRecord) -> Result<DataKeyRecord> {
        let mut keys = self.keys.write();
        if let Some(existing) = latest_active(&keys) {
            return Ok(existing.clone());
        }
        let mut record = record;
        record.active = true;
        keys.push(record.clone());
        Ok(record)
    }

    fn find_active(&self) -> Result<Option<DataKeyRecord>> {
        Ok(latest_active(&self.keys.read()).cloned())
    }

    fn find_key(&self, id: &str) -> Result<Option<DataKeyRecord>> {
        Ok(self.keys.read().iter().find(|k| k.id == id).cloned())
    }

    fn rotate(&self, record: DataKeyRecord, rotated_at: DateTime<Utc>) -> Result<Vec<String>> {
        let mut keys = self.keys.write();
        let mut retired = Vec::new();
        for key in keys.iter_mut().filter(|k| k.active) {
            key.active = false;
            key.rotated_at = Some(rotated_at);
            retired.push(key.id.clone());
        }
        let mut record = record;
        record.active = true;
        keys.push(record);
        Ok(retired)
    }

    fn list_keys(&self) -> Result<Vec<DataKeyRecord>> {
        Ok(self.keys.read().clone())
    }
}

impl VaultItemStore for MemoryStore {
    fn insert_item(&self, item: VaultItemRecord) -> Result<()> {
        let mut items = self.items.write();
        if items.contains_key(&item.id) {
            return Err(VaultError::Storage(format!("duplicate vault item id {}", item.id)));
        }
        items.insert(item.id.clone(), item);
        Ok(())
    }

    fn find_item(&self, id: &str) -> Result<Option<VaultItemRecord>> {
        Ok(self.items.read().get(id).cloned())
    }

    fn delete_item(&self, id: &str) -> Result<bool> {
        Ok(self.items.write().remove(id).is_some())
    }

    fn delete_owner_items(&self, owner_id: &str) -> Result<usize> {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|_, item| item.owner_id != owner_id);
        Ok(before - items.len())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|_, item| !item.is_expired(now));
        Ok(before - items.len())
    }

    fn list_owner_items(&self, owner_id: &str) -> Result<Vec<VaultItemRecord>> {
        let mut owned: Vec<_> = self
            .items
            .read()
            .values()
            .filter(|item| item.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by_key(|item| item.created_at);
        Ok(owned)
    }
}
