//! # reportvault
//!
//! Field-level envelope encryption for sensitive report data.
//!
//! Values are encrypted with a data key; data keys are themselves wrapped
//! by a single master key supplied at startup. Callers keep an opaque
//! pointer (`vault:<id>`) where they used to keep the value, and trade it
//! back for the plaintext on demand. Rotating the data key never requires
//! re-encrypting stored items: each item records which key sealed it.
//!
//! ## Public API
//!
//! ```no_run
//! use std::sync::Arc;
//! use reportvault::{MemoryStore, StoreOptions, Vault, VaultConfig};
//!
//! # fn main() -> Result<(), reportvault::VaultError> {
//! let config = VaultConfig::from_env()?;
//! let vault = Vault::with_master_key(config.master_key()?, Arc::new(MemoryStore::new()));
//!
//! let item = vault.store_string("report-1", "phone", "06 12 34 56 78", StoreOptions::default())?;
//! let pointer = item.pointer();
//! assert_eq!(vault.reveal_string(&pointer)?, "06 12 34 56 78");
//! # Ok(())
//! # }
//! ```

// Module declarations.
pub mod audit;
pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod keys;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod store;
pub mod vault;

pub use config::VaultConfig;
pub use envelope::{Envelope, StoredValue};
pub use error::{Result, VaultError};
pub use keys::{ActiveKey, DataKeyRecord, KeyStore, MasterKey};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
pub use store::{KeyRecordStore, MemoryStore, VaultItemStore};
pub use vault::{
    build_pointer, extract_id, is_pointer, FieldValue, StoreOptions, Vault, VaultItemRecord,
};

/// Generate a cryptographically secure master key.
///
/// In production the master key comes from `CRYPTO_MASTER_KEY` (see
/// [`VaultConfig`]); this is for tests and tooling.
pub fn generate_master_key() -> Result<MasterKey> {
    let bytes = crypto::generate_random_key()?;
    Ok(MasterKey::from_bytes(bytes))
}
