//! Local key lifecycle: identity, signing key, signed prekey, one-time pool.
//!
//! Every mutating call holds the manager's single lock for its whole
//! read-modify-persist sequence, so two callers can never observe or
//! allocate the same prekey id.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::keychain::{
    one_time_prekey_name, parse_one_time_prekey_name, Keychain, KEY_ED25519_PRIVATE,
    KEY_PREKEY_COUNTER, KEY_SIGNED_PREKEY, KEY_X25519_PRIVATE, VAULT_IDENTITY, VAULT_PREKEYS,
};
use crate::keys::bundle::{
    KeyBundle, KeyGenerationResult, OneTimePrekey, PublicOneTimePrekey, SignedPrekey,
};
use crate::keys::identity::{IdentityKeyPair, SigningKeyPair};

/// Tuning for the one-time prekey pool and id allocation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KeyManagerConfig {
    /// Size the pool is refilled to by [`KeyManager::ensure_minimum_one_time_prekeys`].
    pub one_time_prekey_pool_size: usize,
    /// Floor kept by [`KeyManager::rotate_signed_prekey`].
    pub min_one_time_prekeys: usize,
    /// First id handed out on a fresh account.
    pub prekey_id_base: u32,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            one_time_prekey_pool_size: 100,
            min_one_time_prekeys: 20,
            prekey_id_base: 1,
        }
    }
}

#[derive(Default)]
struct KeyState {
    identity: Option<IdentityKeyPair>,
    signing: Option<SigningKeyPair>,
    signed_prekey: Option<SignedPrekey>,
    one_time_prekeys: BTreeMap<u32, OneTimePrekey>,
    next_prekey_id: u32,
}

#[derive(Default)]
struct Generated {
    identity: bool,
    signed_prekey: bool,
    one_time_prekeys: bool,
}

/// Owns all local private key material through a [`Keychain`].
pub struct KeyManager {
    keychain: Arc<dyn Keychain>,
    config: KeyManagerConfig,
    state: Mutex<KeyState>,
}

impl KeyManager {
    /// Load whatever key material the keychain already holds.
    ///
    /// Nothing is generated here; call [`Self::ensure_key_bundle`] for that.
    pub fn load(keychain: Arc<dyn Keychain>, config: KeyManagerConfig) -> Result<Self, CryptoError> {
        let identity = keychain
            .load_key(VAULT_IDENTITY, KEY_X25519_PRIVATE)?
            .map(|bytes| IdentityKeyPair::from_secret_slice(&Zeroizing::new(bytes)))
            .transpose()?;
        let signing = keychain
            .load_key(VAULT_IDENTITY, KEY_ED25519_PRIVATE)?
            .map(|bytes| SigningKeyPair::from_secret_slice(&Zeroizing::new(bytes)))
            .transpose()?;

        let signed_prekey = match keychain.load_key(VAULT_PREKEYS, KEY_SIGNED_PREKEY)? {
            Some(bytes) => match SignedPrekey::from_record_bytes(&Zeroizing::new(bytes)) {
                Ok(spk) => Some(spk),
                Err(e) => {
                    tracing::warn!(error = e.tag(), "discarding unreadable signed prekey");
                    None
                }
            },
            None => None,
        };

        let mut one_time_prekeys = BTreeMap::new();
        for name in keychain.list_keys(VAULT_PREKEYS)? {
            let Some(id) = parse_one_time_prekey_name(&name) else {
                continue;
            };
            let Some(bytes) = keychain.load_key(VAULT_PREKEYS, &name)? else {
                continue;
            };
            match OneTimePrekey::from_secret_slice(id, &Zeroizing::new(bytes)) {
                Ok(prekey) => {
                    one_time_prekeys.insert(id, prekey);
                }
                Err(e) => tracing::warn!(id, error = e.tag(), "skipping unreadable one-time prekey"),
            }
        }

        let stored_counter = keychain
            .load_key(VAULT_PREKEYS, KEY_PREKEY_COUNTER)?
            .map(|bytes| {
                <[u8; 4]>::try_from(bytes.as_slice())
                    .map(u32::from_le_bytes)
                    .map_err(|_| CryptoError::StorageError("corrupt prekey id counter".into()))
            })
            .transpose()?;

        // Never hand out an id at or below one already in use, even if the
        // counter entry was lost.
        let highest_used = one_time_prekeys
            .keys()
            .copied()
            .chain(signed_prekey.as_ref().map(|spk| spk.id))
            .max();
        let next_prekey_id = [
            Some(config.prekey_id_base),
            stored_counter,
            highest_used.and_then(|id| id.checked_add(1)),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(config.prekey_id_base);

        tracing::debug!(
            has_identity = identity.is_some(),
            has_signed_prekey = signed_prekey.is_some(),
            one_time_prekeys = one_time_prekeys.len(),
            next_prekey_id,
            "loaded key manager state"
        );

        Ok(Self {
            keychain,
            config,
            state: Mutex::new(KeyState {
                identity,
                signing,
                signed_prekey,
                one_time_prekeys,
                next_prekey_id,
            }),
        })
    }

    pub fn config(&self) -> &KeyManagerConfig {
        &self.config
    }

    /// Guarantee identity, signing key, a valid signed prekey and at least
    /// `min_one_time_prekeys` one-time prekeys. Generates only what is missing.
    pub fn ensure_key_bundle(
        &self,
        min_one_time_prekeys: usize,
    ) -> Result<KeyGenerationResult, CryptoError> {
        let mut state = self.state.lock();
        let mut generated = Generated::default();

        self.ensure_long_term_keys(&mut state, &mut generated)?;
        self.top_up_one_time_prekeys(&mut state, min_one_time_prekeys, &mut generated)?;

        Self::result(&state, &generated)
    }

    /// Replace the signed prekey even if the current one is valid.
    ///
    /// The previous signed prekey is discarded immediately.
    pub fn rotate_signed_prekey(&self) -> Result<KeyGenerationResult, CryptoError> {
        let mut state = self.state.lock();
        let mut generated = Generated::default();

        self.ensure_long_term_keys(&mut state, &mut generated)?;
        if !generated.signed_prekey {
            self.generate_signed_prekey(&mut state)?;
            generated.signed_prekey = true;
        }
        self.top_up_one_time_prekeys(&mut state, self.config.min_one_time_prekeys, &mut generated)?;

        Self::result(&state, &generated)
    }

    /// Refill the pool to the configured pool size if it dropped below
    /// `threshold`. Returns `None` when no refill was needed.
    pub fn ensure_minimum_one_time_prekeys(
        &self,
        threshold: usize,
    ) -> Result<Option<KeyGenerationResult>, CryptoError> {
        let mut state = self.state.lock();
        if state.one_time_prekeys.len() >= threshold {
            return Ok(None);
        }

        let mut generated = Generated::default();
        self.ensure_long_term_keys(&mut state, &mut generated)?;
        let target = self.config.one_time_prekey_pool_size.max(threshold);
        self.top_up_one_time_prekeys(&mut state, target, &mut generated)?;

        Self::result(&state, &generated).map(Some)
    }

    /// Permanently remove a consumed one-time prekey. Unknown ids are ignored.
    pub fn mark_one_time_prekey_as_used(&self, id: u32) -> Result<(), CryptoError> {
        let mut state = self.state.lock();
        if !state.one_time_prekeys.contains_key(&id) {
            tracing::debug!(id, "one-time prekey already consumed or unknown");
            return Ok(());
        }
        self.keychain
            .delete_key(VAULT_PREKEYS, &one_time_prekey_name(id))?;
        state.one_time_prekeys.remove(&id);
        tracing::debug!(id, remaining = state.one_time_prekeys.len(), "consumed one-time prekey");
        Ok(())
    }

    /// Remove a one-time prekey and hand back its private half in one step.
    ///
    /// Two concurrent callers can never both receive the same key.
    pub fn take_one_time_prekey(&self, id: u32) -> Result<Option<Zeroizing<[u8; 32]>>, CryptoError> {
        let mut state = self.state.lock();
        let Some(prekey) = state.one_time_prekeys.get(&id) else {
            return Ok(None);
        };
        let secret = Zeroizing::new(prekey.secret_key_bytes());
        self.keychain
            .delete_key(VAULT_PREKEYS, &one_time_prekey_name(id))?;
        state.one_time_prekeys.remove(&id);
        tracing::debug!(id, remaining = state.one_time_prekeys.len(), "took one-time prekey");
        Ok(Some(secret))
    }

    pub fn private_one_time_prekey(&self, id: u32) -> Option<Zeroizing<[u8; 32]>> {
        self.state
            .lock()
            .one_time_prekeys
            .get(&id)
            .map(|k| Zeroizing::new(k.secret_key_bytes()))
    }

    pub fn identity_private_key(&self) -> Option<Zeroizing<[u8; 32]>> {
        self.state
            .lock()
            .identity
            .as_ref()
            .map(|k| Zeroizing::new(k.secret_key_bytes()))
    }

    pub fn identity_public_key(&self) -> Option<[u8; 32]> {
        self.state
            .lock()
            .identity
            .as_ref()
            .map(IdentityKeyPair::public_key_bytes)
    }

    /// Private half of the active signed prekey, if its id matches.
    pub fn private_signed_prekey(&self, id: u32) -> Option<Zeroizing<[u8; 32]>> {
        self.state
            .lock()
            .signed_prekey
            .as_ref()
            .filter(|spk| spk.id == id)
            .map(|spk| Zeroizing::new(spk.secret().to_bytes()))
    }

    /// The bundle as it stands, without generating anything.
    pub fn current_bundle(&self) -> Option<KeyBundle> {
        Self::build_bundle(&self.state.lock()).ok()
    }

    pub fn one_time_prekey_count(&self) -> usize {
        self.state.lock().one_time_prekeys.len()
    }

    fn ensure_long_term_keys(
        &self,
        state: &mut KeyState,
        generated: &mut Generated,
    ) -> Result<(), CryptoError> {
        if state.identity.is_none() {
            let identity = IdentityKeyPair::generate();
            self.keychain.store_key(
                VAULT_IDENTITY,
                KEY_X25519_PRIVATE,
                &Zeroizing::new(identity.secret_key_bytes())[..],
            )?;
            tracing::info!(public_key = %hex::encode(identity.public_key_bytes()), "generated identity key");
            state.identity = Some(identity);
            generated.identity = true;
        }

        let signing = match state.signing.take() {
            Some(signing) => signing,
            None => {
                let signing = SigningKeyPair::generate();
                self.keychain
                    .store_key(VAULT_IDENTITY, KEY_ED25519_PRIVATE, signing.secret_key_bytes())?;
                tracing::info!("generated signing key");
                generated.identity = true;
                signing
            }
        };
        let signed_prekey_valid = state.signed_prekey.as_ref().is_some_and(|spk| {
            SigningKeyPair::verify(
                &signing.public_key_bytes(),
                spk.public_key().as_bytes(),
                spk.signature(),
            )
            .is_ok()
        });
        state.signing = Some(signing);

        if !signed_prekey_valid {
            self.generate_signed_prekey(state)?;
            generated.signed_prekey = true;
        }
        Ok(())
    }

    fn generate_signed_prekey(&self, state: &mut KeyState) -> Result<(), CryptoError> {
        let id = self.allocate_prekey_id(state)?;
        let signing = state
            .signing
            .as_ref()
            .ok_or_else(|| CryptoError::KeyGeneration("signing key missing".into()))?;
        let spk = SignedPrekey::generate(id, signing);
        self.keychain
            .store_key(VAULT_PREKEYS, KEY_SIGNED_PREKEY, &spk.to_record_bytes())?;
        let previous = state.signed_prekey.replace(spk).map(|old| old.id);
        tracing::info!(id, ?previous, "generated signed prekey");
        Ok(())
    }

    fn top_up_one_time_prekeys(
        &self,
        state: &mut KeyState,
        target: usize,
        generated: &mut Generated,
    ) -> Result<(), CryptoError> {
        let missing = target.saturating_sub(state.one_time_prekeys.len());
        if missing == 0 {
            return Ok(());
        }
        for _ in 0..missing {
            let id = self.allocate_prekey_id(state)?;
            let prekey = OneTimePrekey::generate(id);
            self.keychain.store_key(
                VAULT_PREKEYS,
                &one_time_prekey_name(id),
                &Zeroizing::new(prekey.secret_key_bytes())[..],
            )?;
            state.one_time_prekeys.insert(id, prekey);
        }
        generated.one_time_prekeys = true;
        tracing::info!(generated = missing, pool = state.one_time_prekeys.len(), "generated one-time prekeys");
        Ok(())
    }

    /// Persist the incremented counter before the id is returned, so a crash
    /// can skip an id but never reuse one.
    fn allocate_prekey_id(&self, state: &mut KeyState) -> Result<u32, CryptoError> {
        let id = state.next_prekey_id;
        let next = id
            .checked_add(1)
            .ok_or_else(|| CryptoError::PreKeyError("prekey id space exhausted".into()))?;
        self.keychain
            .store_key(VAULT_PREKEYS, KEY_PREKEY_COUNTER, &next.to_le_bytes())?;
        state.next_prekey_id = next;
        Ok(id)
    }

    fn result(state: &KeyState, generated: &Generated) -> Result<KeyGenerationResult, CryptoError> {
        Ok(KeyGenerationResult {
            bundle: Self::build_bundle(state)?,
            identity_updated: generated.identity,
            signed_prekey_updated: generated.signed_prekey,
            one_time_prekeys_updated: generated.one_time_prekeys,
        })
    }

    fn build_bundle(state: &KeyState) -> Result<KeyBundle, CryptoError> {
        let missing = |what: &str| CryptoError::PreKeyError(format!("{what} not generated"));
        let identity = state.identity.as_ref().ok_or_else(|| missing("identity key"))?;
        let signing = state.signing.as_ref().ok_or_else(|| missing("signing key"))?;
        let spk = state.signed_prekey.as_ref().ok_or_else(|| missing("signed prekey"))?;

        Ok(KeyBundle {
            identity_key: identity.public_key_bytes().to_vec(),
            signing_key: signing.public_key_bytes().to_vec(),
            signed_prekey_id: spk.id,
            signed_prekey: spk.public_key().as_bytes().to_vec(),
            signed_prekey_signature: spk.signature().to_vec(),
            one_time_prekeys: state
                .one_time_prekeys
                .values()
                .map(|k| PublicOneTimePrekey {
                    id: k.id,
                    public_key: k.public_key().as_bytes().to_vec(),
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::MemoryKeychain;

    fn manager() -> (KeyManager, Arc<MemoryKeychain>) {
        let keychain = Arc::new(MemoryKeychain::new());
        let mgr = KeyManager::load(keychain.clone(), KeyManagerConfig::default()).unwrap();
        (mgr, keychain)
    }

    #[test]
    fn fresh_account_generates_everything() {
        let (mgr, _) = manager();
        assert!(mgr.current_bundle().is_none());

        let result = mgr.ensure_key_bundle(20).unwrap();
        assert!(result.identity_updated);
        assert!(result.signed_prekey_updated);
        assert!(result.one_time_prekeys_updated);
        assert_eq!(result.bundle.one_time_prekeys.len(), 20);
        result.bundle.verify_signed_prekey().unwrap();
    }

    #[test]
    fn second_ensure_is_a_no_op() {
        let (mgr, _) = manager();
        let first = mgr.ensure_key_bundle(20).unwrap();
        let second = mgr.ensure_key_bundle(20).unwrap();

        assert!(!second.any_updated());
        assert_eq!(first.bundle, second.bundle);
    }

    #[test]
    fn ensure_with_larger_minimum_only_adds_prekeys() {
        let (mgr, _) = manager();
        let first = mgr.ensure_key_bundle(5).unwrap();
        let second = mgr.ensure_key_bundle(8).unwrap();

        assert!(!second.identity_updated);
        assert!(!second.signed_prekey_updated);
        assert!(second.one_time_prekeys_updated);
        assert_eq!(second.bundle.one_time_prekeys.len(), 8);
        assert_eq!(first.bundle.identity_key, second.bundle.identity_key);
    }

    #[test]
    fn rotation_replaces_signed_prekey_only() {
        let (mgr, _) = manager();
        let before = mgr.ensure_key_bundle(20).unwrap();
        let after = mgr.rotate_signed_prekey().unwrap();

        assert!(!after.identity_updated);
        assert!(after.signed_prekey_updated);
        assert!(!after.one_time_prekeys_updated);
        assert!(after.bundle.signed_prekey_id > before.bundle.signed_prekey_id);
        assert_ne!(after.bundle.signed_prekey, before.bundle.signed_prekey);
        assert_eq!(after.bundle.identity_key, before.bundle.identity_key);
        assert_eq!(after.bundle.one_time_prekeys, before.bundle.one_time_prekeys);
        after.bundle.verify_signed_prekey().unwrap();
        assert!(mgr.private_signed_prekey(before.bundle.signed_prekey_id).is_none());
    }

    #[test]
    fn rotation_tops_up_below_floor() {
        let (mgr, _) = manager();
        mgr.ensure_key_bundle(3).unwrap();
        let rotated = mgr.rotate_signed_prekey().unwrap();
        assert!(rotated.one_time_prekeys_updated);
        assert_eq!(rotated.bundle.one_time_prekeys.len(), 20);
    }

    #[test]
    fn minimum_refill_only_below_threshold() {
        let (mgr, _) = manager();
        mgr.ensure_key_bundle(20).unwrap();

        assert!(mgr.ensure_minimum_one_time_prekeys(10).unwrap().is_none());

        let refilled = mgr.ensure_minimum_one_time_prekeys(25).unwrap().unwrap();
        assert!(refilled.one_time_prekeys_updated);
        assert!(!refilled.signed_prekey_updated);
        assert_eq!(refilled.bundle.one_time_prekeys.len(), 100);
    }

    #[test]
    fn consumption_is_one_shot() {
        let (mgr, _) = manager();
        let bundle = mgr.ensure_key_bundle(5).unwrap().bundle;
        let id = bundle.one_time_prekeys[2].id;

        assert!(mgr.private_one_time_prekey(id).is_some());
        mgr.mark_one_time_prekey_as_used(id).unwrap();
        assert!(mgr.private_one_time_prekey(id).is_none());

        // Consuming again is a no-op.
        mgr.mark_one_time_prekey_as_used(id).unwrap();

        let refilled = mgr.ensure_key_bundle(5).unwrap().bundle;
        assert!(!refilled.one_time_prekey_ids().contains(&id));
    }

    #[test]
    fn take_returns_key_once() {
        let (mgr, keychain) = manager();
        let bundle = mgr.ensure_key_bundle(2).unwrap().bundle;
        let id = bundle.one_time_prekeys[0].id;
        let expected = mgr.private_one_time_prekey(id).unwrap();

        assert_eq!(*mgr.take_one_time_prekey(id).unwrap().unwrap(), *expected);
        assert!(mgr.take_one_time_prekey(id).unwrap().is_none());
        assert!(!keychain
            .key_exists(VAULT_PREKEYS, &one_time_prekey_name(id))
            .unwrap());
    }

    #[test]
    fn state_survives_reload() {
        let (mgr, keychain) = manager();
        let original = mgr.ensure_key_bundle(4).unwrap().bundle;
        let consumed = original.one_time_prekeys[0].id;
        mgr.mark_one_time_prekey_as_used(consumed).unwrap();
        drop(mgr);

        let reloaded = KeyManager::load(keychain, KeyManagerConfig::default()).unwrap();
        let result = reloaded.ensure_key_bundle(3).unwrap();
        assert!(!result.any_updated());
        assert_eq!(result.bundle.identity_key, original.identity_key);
        assert_eq!(result.bundle.signed_prekey_id, original.signed_prekey_id);
        assert_eq!(
            result.bundle.one_time_prekey_ids(),
            original.one_time_prekey_ids()[1..].to_vec()
        );

        // New ids continue above everything issued before the reload.
        let grown = reloaded.ensure_key_bundle(4).unwrap().bundle;
        let max_before = original.one_time_prekey_ids().into_iter().max().unwrap();
        assert!(grown.one_time_prekey_ids().iter().any(|&id| id > max_before));
        assert!(!grown.one_time_prekey_ids().contains(&consumed));
    }

    #[test]
    fn ids_start_at_configured_base() {
        let keychain = Arc::new(MemoryKeychain::new());
        let config = KeyManagerConfig {
            prekey_id_base: 1000,
            ..KeyManagerConfig::default()
        };
        let mgr = KeyManager::load(keychain, config).unwrap();
        let bundle = mgr.ensure_key_bundle(2).unwrap().bundle;
        assert_eq!(bundle.signed_prekey_id, 1000);
        assert_eq!(bundle.one_time_prekey_ids(), vec![1001, 1002]);
    }

    #[test]
    fn lost_counter_never_reuses_ids() {
        let (mgr, keychain) = manager();
        let bundle = mgr.ensure_key_bundle(3).unwrap().bundle;
        drop(mgr);
        keychain.delete_key(VAULT_PREKEYS, KEY_PREKEY_COUNTER).unwrap();

        let reloaded = KeyManager::load(keychain, KeyManagerConfig::default()).unwrap();
        let rotated = reloaded.rotate_signed_prekey().unwrap().bundle;
        let max_before = bundle.one_time_prekey_ids().into_iter().max().unwrap();
        assert!(rotated.signed_prekey_id > max_before);
    }

    #[test]
    fn accessors_return_none_before_generation() {
        let (mgr, _) = manager();
        assert!(mgr.identity_private_key().is_none());
        assert!(mgr.identity_public_key().is_none());
        assert!(mgr.private_one_time_prekey(1).is_none());
        assert_eq!(mgr.one_time_prekey_count(), 0);

        mgr.ensure_key_bundle(1).unwrap();
        let public = mgr.identity_public_key().unwrap();
        let private = mgr.identity_private_key().unwrap();
        assert_eq!(
            IdentityKeyPair::from_secret_bytes(*private).public_key_bytes(),
            public
        );
    }
}
