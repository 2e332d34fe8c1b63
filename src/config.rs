//! Process configuration.
//!
//! The master key arrives through the environment at startup and lives only
//! in memory afterwards:
//!
//! | Variable | Required | Meaning |
//! |---|---|---|
//! | `CRYPTO_MASTER_KEY` | yes | 32-byte master key, 64 hex characters |
//! | `CRYPTO_ALGO` | no | AEAD algorithm; only `aes-256-gcm` is accepted |

use std::fmt;

use serde::{Deserialize, Deserializer};
use tracing::info;
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};
use crate::keys::MasterKey;

pub const MASTER_KEY_VAR: &str = "CRYPTO_MASTER_KEY";
pub const ALGORITHM_VAR: &str = "CRYPTO_ALGO";
pub const DEFAULT_ALGORITHM: &str = "aes-256-gcm";

fn default_algorithm() -> String {
    DEFAULT_ALGORITHM.to_string()
}

fn zeroizing_string<'de, D>(deserializer: D) -> std::result::Result<Zeroizing<String>, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(Zeroizing::new)
}

/// Not `Clone`: the master key text exists once and is wiped on drop.
#[derive(Deserialize)]
pub struct VaultConfig {
    #[serde(deserialize_with = "zeroizing_string")]
    master_key_hex: Zeroizing<String>,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
}

impl fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultConfig")
            .field("master_key_hex", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl VaultConfig {
    /// Read and validate the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env`, with an injectable variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let master_key_hex = lookup(MASTER_KEY_VAR)
            .map(Zeroizing::new)
            .ok_or_else(|| VaultError::Config(format!("{MASTER_KEY_VAR} is not set")))?;
        let algorithm = lookup(ALGORITHM_VAR).unwrap_or_else(default_algorithm);

        let config = Self {
            master_key_hex,
            algorithm,
        };
        config.validate()?;
        info!(algorithm = %config.algorithm, "loaded vault configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.algorithm.eq_ignore_ascii_case(DEFAULT_ALGORITHM) {
            return Err(VaultError::Config(format!(
                "unsupported algorithm {:?}, expected {DEFAULT_ALGORITHM}",
                self.algorithm
            )));
        }
        self.master_key().map(|_| ())
    }

    /// Decode the configured master key.
    pub fn master_key(&self) -> Result<MasterKey> {
        MasterKey::from_hex(&self.master_key_hex).map_err(|_| {
            VaultError::Config(format!(
                "{MASTER_KEY_VAR} must be 32 bytes encoded as 64 hex characters"
            ))
        })
    }
}
