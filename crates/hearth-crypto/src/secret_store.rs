//! At-rest keychain backed by an `iota_stronghold` snapshot.
//!
//! Entries live in the client `Store` under `vault/key`, and each vault keeps
//! a sorted name index beside them so keys can be listed. The snapshot is
//! encrypted with an `Argon2id`-derived key from the account passphrase and is
//! committed after every mutation. A failed commit rolls the in-memory store
//! back, so a later read never sees a key the snapshot does not hold.

use std::collections::BTreeSet;
use std::path::Path;

use iota_stronghold::{Client, KeyProvider, SnapshotPath, Stronghold};
use parking_lot::Mutex;
use zeroize::Zeroizing;

use crate::keychain::Keychain;
use crate::CryptoError;

const CLIENT_NAME: &[u8] = b"hearth";
const INDEX_PREFIX: &str = "__index";

/// A pending write: `None` deletes the entry.
type Change = (Vec<u8>, Option<Vec<u8>>);

fn entry_name(vault: &str, key: &str) -> Vec<u8> {
    format!("{vault}/{key}").into_bytes()
}

fn index_name(vault: &str) -> Vec<u8> {
    format!("{INDEX_PREFIX}/{vault}").into_bytes()
}

fn storage_error(context: &str, e: impl std::fmt::Display) -> CryptoError {
    CryptoError::StorageError(format!("{context}: {e}"))
}

struct Snapshot {
    stronghold: Stronghold,
    path: SnapshotPath,
    keyprovider: KeyProvider,
}

impl Snapshot {
    fn client(&self) -> Result<Client, CryptoError> {
        self.stronghold
            .get_client(CLIENT_NAME)
            .map_err(|e| storage_error("get client", e))
    }

    fn commit(&self) -> Result<(), CryptoError> {
        self.stronghold
            .write_client(CLIENT_NAME)
            .map_err(|e| storage_error("write client", e))?;
        self.stronghold
            .commit_with_keyprovider(&self.path, &self.keyprovider)
            .map_err(|e| storage_error("commit snapshot", e))?;
        Ok(())
    }

    fn load_index(client: &Client, vault: &str) -> Result<BTreeSet<String>, CryptoError> {
        let Some(raw) = client
            .store()
            .get(&index_name(vault))
            .map_err(|e| storage_error("store get", e))?
        else {
            return Ok(BTreeSet::new());
        };
        serde_json::from_slice(&raw).map_err(|e| storage_error("corrupt index", e))
    }

    fn index_change(vault: &str, names: &BTreeSet<String>) -> Result<Change, CryptoError> {
        let encoded = serde_json::to_vec(names).map_err(|e| storage_error("encode index", e))?;
        Ok((index_name(vault), Some(encoded)))
    }

    /// Apply `changes` and commit them. Anything applied before a failure is
    /// reverted.
    fn apply(&self, changes: Vec<Change>) -> Result<(), CryptoError> {
        let client = self.client()?;
        let mut undo: Vec<Change> = Vec::with_capacity(changes.len());
        let result = Self::write_all(&client, changes, &mut undo).and_then(|()| self.commit());
        if result.is_err() {
            for (name, previous) in undo.into_iter().rev() {
                if let Err(e) = Self::write_one(&client, name, previous) {
                    tracing::warn!(error = %e, "keychain rollback failed");
                }
            }
        }
        result
    }

    fn write_all(
        client: &Client,
        changes: Vec<Change>,
        undo: &mut Vec<Change>,
    ) -> Result<(), CryptoError> {
        for (name, value) in changes {
            let previous = client
                .store()
                .get(&name)
                .map_err(|e| storage_error("store get", e))?;
            Self::write_one(client, name.clone(), value)?;
            undo.push((name, previous));
        }
        Ok(())
    }

    fn write_one(client: &Client, name: Vec<u8>, value: Option<Vec<u8>>) -> Result<(), CryptoError> {
        let store = client.store();
        match value {
            Some(value) => {
                store
                    .insert(name, value, None)
                    .map_err(|e| storage_error("store insert", e))?;
            }
            None => {
                store
                    .delete(&name)
                    .map_err(|e| storage_error("store delete", e))?;
            }
        }
        Ok(())
    }
}

/// A passphrase-protected keychain persisted to one Stronghold snapshot.
pub struct EncryptedFileKeychain {
    inner: Mutex<Snapshot>,
}

impl EncryptedFileKeychain {
    /// Open the snapshot for an account, creating an empty one if missing.
    ///
    /// Each account gets its own file named `{account_id}.stronghold`, since
    /// each account has its own passphrase.
    pub fn open_for_account(
        dir: &Path,
        account_id: &str,
        passphrase: &str,
    ) -> Result<Self, CryptoError> {
        Self::open(&snapshot_file(dir, account_id), passphrase)
    }

    /// Open a snapshot file. A wrong passphrase fails with a storage error.
    pub fn open(path: &Path, passphrase: &str) -> Result<Self, CryptoError> {
        let key = derive_snapshot_key(passphrase, &snapshot_salt(path))?;
        let keyprovider = KeyProvider::try_from(key)
            .map_err(|e| CryptoError::StorageError(format!("key provider init: {e:?}")))?;
        let snapshot = Snapshot {
            stronghold: Stronghold::default(),
            path: SnapshotPath::from_path(path),
            keyprovider,
        };

        let existing = path.exists();
        if existing {
            snapshot
                .stronghold
                .load_snapshot(&snapshot.keyprovider, &snapshot.path)
                .map_err(|e| storage_error("load snapshot", e))?;
        }
        let _client = snapshot
            .stronghold
            .load_client(CLIENT_NAME)
            .or_else(|_| snapshot.stronghold.create_client(CLIENT_NAME))
            .map_err(|e| storage_error("client init", e))?;

        if existing {
            tracing::debug!(path = %path.display(), "loaded keychain snapshot");
        } else {
            snapshot.commit()?;
            tracing::debug!(path = %path.display(), "created keychain snapshot");
        }
        Ok(Self {
            inner: Mutex::new(snapshot),
        })
    }

    /// Delete the snapshot file for an account.
    pub fn delete_snapshot(dir: &Path, account_id: &str) -> Result<(), std::io::Error> {
        let file = snapshot_file(dir, account_id);
        if file.exists() {
            std::fs::remove_file(file)?;
        }
        Ok(())
    }
}

impl Keychain for EncryptedFileKeychain {
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        let snapshot = self.inner.lock();
        let mut names = Snapshot::load_index(&snapshot.client()?, vault)?;
        let mut changes = vec![(entry_name(vault, key), Some(data.to_vec()))];
        if names.insert(key.to_string()) {
            changes.push(Snapshot::index_change(vault, &names)?);
        }
        snapshot.apply(changes)
    }

    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        self.inner
            .lock()
            .client()?
            .store()
            .get(&entry_name(vault, key))
            .map_err(|e| storage_error("store get", e))
    }

    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError> {
        let snapshot = self.inner.lock();
        let mut names = Snapshot::load_index(&snapshot.client()?, vault)?;
        if !names.remove(key) {
            return Ok(());
        }
        let changes = vec![
            (entry_name(vault, key), None),
            Snapshot::index_change(vault, &names)?,
        ];
        snapshot.apply(changes)
    }

    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError> {
        self.inner
            .lock()
            .client()?
            .store()
            .contains_key(&entry_name(vault, key))
            .map_err(|e| storage_error("store contains", e))
    }

    fn list_keys(&self, vault: &str) -> Result<Vec<String>, CryptoError> {
        let snapshot = self.inner.lock();
        let names = Snapshot::load_index(&snapshot.client()?, vault)?;
        Ok(names.into_iter().collect())
    }
}

fn snapshot_file(dir: &Path, account_id: &str) -> std::path::PathBuf {
    dir.join(format!("{account_id}.stronghold"))
}

/// Per-file KDF salt, so two accounts with the same passphrase get
/// different snapshot keys.
fn snapshot_salt(path: &Path) -> Vec<u8> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("hearth-keychain:{name}").into_bytes()
}

/// Derive the 32-byte snapshot key from a passphrase using `Argon2id`.
///
/// Production: `m=65536, t=3, p=4`.
/// Debug builds: `m=256, t=1, p=1` (fast iteration).
fn derive_snapshot_key(passphrase: &str, salt: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    use argon2::{Algorithm, Argon2, Params, Version};

    #[cfg(debug_assertions)]
    let params = Params::new(256, 1, 1, Some(32));
    #[cfg(not(debug_assertions))]
    let params = Params::new(65536, 3, 4, Some(32));
    let params = params.map_err(|e| storage_error("argon2 params", e))?;

    let hasher = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new(vec![0u8; 32]);
    hasher
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| storage_error("argon2", e))?;
    Ok(key)
}
