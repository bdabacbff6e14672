//! Public key directory: publishing our bundle and fetching peers' bundles.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hearth_crypto::keys::PublicOneTimePrekey;
use hearth_crypto::{KeyBundle, KeyGenerationResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// One-time prekey entry as stored in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryPrekey {
    pub id: u32,
    pub public_key: String,
}

/// A user's public key record in the remote directory. Binary fields are
/// standard base64.
///
/// Any absent or blank required field makes the record incomplete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_signature_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_pre_key_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_pre_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_pre_key_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_pre_keys: Option<Vec<DirectoryPrekey>>,
}

fn present(field: Option<&String>) -> bool {
    field.is_some_and(|value| !value.trim().is_empty())
}

impl DirectoryRecord {
    pub fn from_bundle(bundle: &KeyBundle) -> Self {
        Self {
            identity_public_key: Some(STANDARD.encode(&bundle.identity_key)),
            identity_signature_public_key: Some(STANDARD.encode(&bundle.signing_key)),
            signed_pre_key_id: Some(bundle.signed_prekey_id),
            signed_pre_key: Some(STANDARD.encode(&bundle.signed_prekey)),
            signed_pre_key_signature: Some(STANDARD.encode(&bundle.signed_prekey_signature)),
            one_time_pre_keys: Some(
                bundle
                    .one_time_prekeys
                    .iter()
                    .map(|k| DirectoryPrekey {
                        id: k.id,
                        public_key: STANDARD.encode(&k.public_key),
                    })
                    .collect(),
            ),
        }
    }

    pub fn is_complete(&self) -> bool {
        present(self.identity_public_key.as_ref())
            && present(self.identity_signature_public_key.as_ref())
            && self.signed_pre_key_id.is_some()
            && present(self.signed_pre_key.as_ref())
            && present(self.signed_pre_key_signature.as_ref())
            && self.one_time_pre_keys.is_some()
    }

    /// Overlay the fields set in `update`; fields it leaves unset are kept.
    pub fn merge(&mut self, update: &DirectoryRecord) {
        fn overlay<T: Clone>(slot: &mut Option<T>, value: Option<&T>) {
            if let Some(value) = value {
                *slot = Some(value.clone());
            }
        }
        overlay(&mut self.identity_public_key, update.identity_public_key.as_ref());
        overlay(
            &mut self.identity_signature_public_key,
            update.identity_signature_public_key.as_ref(),
        );
        overlay(&mut self.signed_pre_key_id, update.signed_pre_key_id.as_ref());
        overlay(&mut self.signed_pre_key, update.signed_pre_key.as_ref());
        overlay(&mut self.signed_pre_key_signature, update.signed_pre_key_signature.as_ref());
        overlay(&mut self.one_time_pre_keys, update.one_time_pre_keys.as_ref());
    }

    /// Decode into a bundle. `None` if the record is incomplete.
    pub fn to_bundle(&self) -> Result<Option<KeyBundle>, String> {
        if !self.is_complete() {
            return Ok(None);
        }
        let (
            Some(identity),
            Some(signing),
            Some(signed_prekey_id),
            Some(signed_prekey),
            Some(signature),
            Some(one_time),
        ) = (
            &self.identity_public_key,
            &self.identity_signature_public_key,
            self.signed_pre_key_id,
            &self.signed_pre_key,
            &self.signed_pre_key_signature,
            &self.one_time_pre_keys,
        )
        else {
            return Ok(None);
        };

        let decode = |field: &str, value: &str| {
            STANDARD
                .decode(value.trim())
                .map_err(|_| format!("{field} is not valid base64"))
        };
        let one_time_prekeys = one_time
            .iter()
            .map(|k| {
                Ok(PublicOneTimePrekey {
                    id: k.id,
                    public_key: decode("oneTimePreKeys.publicKey", k.public_key.as_str())?,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;

        Ok(Some(KeyBundle {
            identity_key: decode("identityPublicKey", identity.as_str())?,
            signing_key: decode("identitySignaturePublicKey", signing.as_str())?,
            signed_prekey_id,
            signed_prekey: decode("signedPreKey", signed_prekey.as_str())?,
            signed_prekey_signature: decode("signedPreKeySignature", signature.as_str())?,
            one_time_prekeys,
        }))
    }
}

/// Remote user directory. Writes are merges.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    async fn read_record(&self, uid: &str) -> Result<Option<DirectoryRecord>, SyncError>;

    /// Merge `record` into whatever is stored for `uid`.
    async fn merge_record(&self, uid: &str, record: &DirectoryRecord) -> Result<(), SyncError>;
}

struct CacheInner {
    bundles: HashMap<String, KeyBundle>,
    // Insertion order, oldest first.
    order: VecDeque<String>,
}

/// Cache of fetched peer bundles, keyed by uid. Oldest insertion is evicted
/// first once `capacity` is reached.
pub struct BundleCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl BundleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                bundles: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, uid: &str) -> Option<KeyBundle> {
        self.inner.lock().bundles.get(uid).cloned()
    }

    pub fn insert(&self, uid: &str, bundle: KeyBundle) {
        let mut inner = self.inner.lock();
        if inner.bundles.insert(uid.to_string(), bundle).is_some() {
            inner.order.retain(|cached| cached != uid);
        }
        inner.order.push_back(uid.to_string());
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.bundles.remove(&oldest);
            }
        }
    }

    pub fn invalidate(&self, uid: &str) {
        let mut inner = self.inner.lock();
        if inner.bundles.remove(uid).is_some() {
            inner.order.retain(|cached| cached != uid);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.bundles.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().bundles.is_empty()
    }
}

/// Publishes and fetches key bundles through a [`KeyDirectory`].
#[derive(Clone)]
pub struct KeyDirectoryClient {
    directory: Arc<dyn KeyDirectory>,
    cache: Arc<BundleCache>,
}

impl KeyDirectoryClient {
    pub fn new(directory: Arc<dyn KeyDirectory>, cache: Arc<BundleCache>) -> Self {
        Self { directory, cache }
    }

    pub fn cache(&self) -> &Arc<BundleCache> {
        &self.cache
    }

    /// Write the full public record for `uid`. Safe to repeat.
    pub async fn publish(&self, uid: &str, bundle: &KeyBundle) -> Result<(), SyncError> {
        let record = DirectoryRecord::from_bundle(bundle);
        self.directory.merge_record(uid, &record).await?;
        self.cache.invalidate(uid);
        tracing::info!(
            uid,
            signed_prekey_id = bundle.signed_prekey_id,
            one_time_prekeys = bundle.one_time_prekeys.len(),
            "published key bundle"
        );
        Ok(())
    }

    /// Publish when anything was regenerated or the remote record is missing
    /// or incomplete. Returns whether a write happened.
    pub async fn publish_if_needed(
        &self,
        uid: &str,
        result: &KeyGenerationResult,
    ) -> Result<bool, SyncError> {
        if !result.any_updated() {
            let remote = self.directory.read_record(uid).await?;
            if remote.as_ref().is_some_and(DirectoryRecord::is_complete) {
                tracing::debug!(uid, "directory record up to date");
                return Ok(false);
            }
        }
        self.publish(uid, &result.bundle).await?;
        Ok(true)
    }

    /// Fetch a peer's bundle, from cache when possible.
    ///
    /// Missing or incomplete records yield `None` and are not cached. A
    /// bundle whose signed prekey signature does not verify is rejected.
    pub async fn fetch(&self, uid: &str) -> Result<Option<KeyBundle>, SyncError> {
        if let Some(bundle) = self.cache.get(uid) {
            return Ok(Some(bundle));
        }

        let Some(record) = self.directory.read_record(uid).await? else {
            tracing::debug!(uid, "no directory record");
            return Ok(None);
        };
        let bundle = match record.to_bundle() {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                tracing::debug!(uid, "directory record incomplete");
                return Ok(None);
            }
            Err(reason) => {
                tracing::warn!(uid, %reason, "undecodable directory record");
                return Err(SyncError::InvalidBundle {
                    uid: uid.to_string(),
                    reason,
                });
            }
        };
        if let Err(e) = bundle.verify_signed_prekey() {
            tracing::warn!(uid, error = e.tag(), "rejecting bundle with bad signed prekey signature");
            return Err(SyncError::InvalidBundle {
                uid: uid.to_string(),
                reason: "signed prekey signature does not verify".into(),
            });
        }

        self.cache.insert(uid, bundle.clone());
        Ok(Some(bundle))
    }

    pub fn invalidate(&self, uid: &str) {
        self.cache.invalidate(uid);
    }
}
