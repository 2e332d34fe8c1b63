//! Minimal example: reportvault behind a report attachment table.
//!
//! Demonstrates pointer storage, legacy plaintext coexistence, key rotation
//! and audit logging with file persistence.
//! Run with: `cargo run --example report_attachment_demo`
//!
//! With `CRYPTO_MASTER_KEY` set, items persist in a SQLite file under the
//! temp directory. Without it, a throwaway key and an in-memory database
//! are used for the run.

use std::sync::Arc;

use reportvault::audit::FileAuditSink;
use reportvault::{
    generate_master_key, FieldValue, SqliteStore, StoreOptions, Vault, VaultConfig,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 1. Setup
    let (master, store) = match VaultConfig::from_env() {
        Ok(config) => {
            let db_path = std::env::temp_dir().join("reportvault_demo.db");
            (config.master_key()?, SqliteStore::open(&db_path)?)
        }
        Err(_) => (generate_master_key()?, SqliteStore::open_in_memory()?),
    };
    let vault = Vault::with_master_key(master, Arc::new(store));

    let audit_path = std::env::temp_dir().join("reportvault_audit.jsonl");
    vault.add_audit_sink(Box::new(FileAuditSink::new(&audit_path)?));

    // 2. Register an attachment: the table keeps only the pointer.
    let item = vault.store_string(
        "report-1",
        "reportAttachment.storageKey",
        "uploads/2024/scene-photo-01.png",
        StoreOptions::default(),
    )?;
    let attachment_rows = [item.pointer(), "uploads/legacy/scan-0007.pdf".to_string()];

    // 3. Read back; legacy rows pass through unchanged.
    for row in &attachment_rows {
        let kind = match FieldValue::classify(row) {
            FieldValue::Pointer(_) => "vault",
            FieldValue::Plaintext(_) => "legacy",
        };
        println!("{kind:>6}: {row} -> {}", vault.resolve_field(row)?);
    }

    // 4. Rotate; the existing pointer keeps working.
    let key = vault.rotate_key(Some("demo-rotation"))?;
    println!("Rotated to data key {}", key.id());
    println!("After rotation: {}", vault.reveal_string(&attachment_rows[0])?);

    // 5. Delete the module: scrub the pointer.
    vault.delete_pointer(&attachment_rows[0])?;

    // 6. Audit log
    let log = vault.audit_log();
    println!("Audit log: {} record(s)", log.len());
    for record in log.iter() {
        println!(
            "  {:?} item={:?} key={:?} @ {}",
            record.action, record.item_id, record.key_id, record.timestamp
        );
    }
    println!("Full audit also written to: {}", audit_path.display());

    Ok(())
}
