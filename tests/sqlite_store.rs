#![cfg(feature = "sqlite")]

use std::sync::Arc;
use std::thread;

use chrono::{Duration, Utc};
use reportvault::{
    KeyRecordStore, MasterKey, SqliteStore, StoreOptions, Vault, VaultError, VaultItemStore,
};

const MASTER: [u8; 32] = [0x5Au8; 32];

#[test]
fn test_items_survive_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.db");

    let (old_pointer, new_pointer) = {
        let vault = Vault::with_master_key(
            MasterKey::from_bytes(MASTER),
            Arc::new(SqliteStore::open(&path).unwrap()),
        );
        let old = vault
            .store_string("report-1", "phone", "06 12 34 56 78", StoreOptions::default())
            .unwrap();
        vault.rotate_key(Some("after-incident")).unwrap();
        let new = vault
            .store_json("report-1", "contact", &serde_json::json!({"email": "a@b.fr"}), StoreOptions::default())
            .unwrap();
        (old.pointer(), new.pointer())
    };

    // A fresh process: new connection, empty caches, same master key.
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let vault = Vault::with_master_key(MasterKey::from_bytes(MASTER), Arc::clone(&store));

    assert_eq!(vault.reveal_string(&old_pointer).unwrap(), "06 12 34 56 78");
    let contact: serde_json::Value = vault.reveal_json(&new_pointer).unwrap();
    assert_eq!(contact["email"], "a@b.fr");

    let keys = store.list_keys().unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys.iter().filter(|k| k.active).count(), 1);
    assert_eq!(store.find_active().unwrap().unwrap().label, "after-incident");
}

#[test]
fn test_wrong_master_key_against_persisted_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vault.db");

    let pointer = {
        let vault = Vault::with_master_key(
            MasterKey::from_bytes(MASTER),
            Arc::new(SqliteStore::open(&path).unwrap()),
        );
        vault
            .store_string("report-1", "phone", "secret", StoreOptions::default())
            .unwrap()
            .pointer()
    };

    let vault = Vault::with_master_key(
        MasterKey::from_bytes([0u8; 32]),
        Arc::new(SqliteStore::open(&path).unwrap()),
    );
    assert!(matches!(vault.reveal(&pointer), Err(VaultError::KeyIntegrity(_))));
}

#[test]
fn test_concurrent_rotations_commit_atomically() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let vault = Arc::new(Vault::with_master_key(MasterKey::from_bytes(MASTER), Arc::clone(&store)));
    vault.key_store().get_active_key().unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let vault = Arc::clone(&vault);
            thread::spawn(move || vault.rotate_key(None).map(|_| ()))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let keys = store.list_keys().unwrap();
    assert_eq!(keys.len(), 9);
    assert_eq!(keys.iter().filter(|k| k.active).count(), 1);
}

#[test]
fn test_deletes_and_expiry() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let vault = Vault::with_master_key(MasterKey::from_bytes(MASTER), Arc::clone(&store));

    let expired = vault
        .store_string(
            "report-1",
            "attachment",
            "s3://bucket/old.png",
            StoreOptions {
                expires_at: Some(Utc::now() - Duration::seconds(1)),
            },
        )
        .unwrap();
    let kept = vault
        .store_string("report-1", "attachment", "s3://bucket/new.png", StoreOptions::default())
        .unwrap();
    vault
        .store_string("report-2", "attachment", "s3://bucket/other.png", StoreOptions::default())
        .unwrap();

    assert_eq!(vault.purge_expired().unwrap(), 1);
    assert!(store.find_item(&expired.id).unwrap().is_none());

    vault.delete_pointer(&kept.pointer()).unwrap();
    vault.delete_pointer(&kept.pointer()).unwrap();
    assert!(matches!(vault.reveal(&kept.pointer()), Err(VaultError::ItemNotFound(_))));

    assert_eq!(vault.delete_owner("report-2").unwrap(), 1);
    assert_eq!(vault.delete_owner("report-2").unwrap(), 0);
}
