use std::collections::BTreeMap;

use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::CryptoError;

/// Trait for key storage — abstracts over the actual backend.
///
/// [`crate::secret_store::EncryptedFileKeychain`] persists to an encrypted
/// snapshot on disk; [`MemoryKeychain`] keeps everything in process memory.
/// Only the key manager writes through this trait.
pub trait Keychain: Send + Sync {
    /// Store a key under a vault/key pair.
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError>;

    /// Retrieve a key from a vault/key pair.
    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    /// Delete a key from a vault/key pair. Deleting a missing key is not an error.
    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError>;

    /// Check if a key exists.
    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError>;

    /// List key names stored in a vault, sorted ascending.
    fn list_keys(&self, vault: &str) -> Result<Vec<String>, CryptoError>;
}

// Vault and key constants used by the key manager.

/// Vault for long-term identity keys.
pub const VAULT_IDENTITY: &str = "identity";
/// X25519 Diffie-Hellman private key.
pub const KEY_X25519_PRIVATE: &str = "x25519_private";
/// Ed25519 signing private key.
pub const KEY_ED25519_PRIVATE: &str = "ed25519_private";

/// Vault for prekeys.
pub const VAULT_PREKEYS: &str = "prekeys";
/// Current signed prekey record.
pub const KEY_SIGNED_PREKEY: &str = "signed_prekey";
/// Next prekey id to allocate.
pub const KEY_PREKEY_COUNTER: &str = "next_prekey_id";
/// Prefix of one-time prekey entries.
pub const ONE_TIME_PREKEY_PREFIX: &str = "otpk_";

/// Generate the storage key name for a one-time prekey.
///
/// Zero-padded so lexical order matches numeric order.
pub fn one_time_prekey_name(id: u32) -> String {
    format!("{ONE_TIME_PREKEY_PREFIX}{id:010}")
}

/// Parse a one-time prekey id back out of its storage key name.
pub fn parse_one_time_prekey_name(name: &str) -> Option<u32> {
    name.strip_prefix(ONE_TIME_PREKEY_PREFIX)?.parse().ok()
}

/// In-memory keychain.
///
/// Suitable for tests and for sessions that must not touch disk.
/// **WARNING**: data is lost on process exit.
#[derive(Default)]
pub struct MemoryKeychain {
    entries: Mutex<BTreeMap<String, BTreeMap<String, Zeroizing<Vec<u8>>>>>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Keychain for MemoryKeychain {
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        self.entries
            .lock()
            .entry(vault.to_string())
            .or_default()
            .insert(key.to_string(), Zeroizing::new(data.to_vec()));
        Ok(())
    }

    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self
            .entries
            .lock()
            .get(vault)
            .and_then(|v| v.get(key))
            .map(|data| data.to_vec()))
    }

    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError> {
        if let Some(v) = self.entries.lock().get_mut(vault) {
            v.remove(key);
        }
        Ok(())
    }

    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError> {
        Ok(self
            .entries
            .lock()
            .get(vault)
            .is_some_and(|v| v.contains_key(key)))
    }

    fn list_keys(&self, vault: &str) -> Result<Vec<String>, CryptoError> {
        Ok(self
            .entries
            .lock()
            .get(vault)
            .map(|v| v.keys().cloned().collect())
            .unwrap_or_default())
    }
}
