//! Prekey types and the public key bundle published to the directory.

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::keys::identity::SigningKeyPair;

const SIGNATURE_LEN: usize = 64;
/// Stored signed prekey: id (4 LE) + private (32) + signature (64).
const SIGNED_PREKEY_RECORD_LEN: usize = 4 + 32 + SIGNATURE_LEN;

/// The active signed prekey, including its private half.
#[derive(ZeroizeOnDrop)]
pub struct SignedPrekey {
    #[zeroize(skip)]
    pub id: u32,
    secret: StaticSecret,
    #[zeroize(skip)]
    signature: [u8; SIGNATURE_LEN],
}

impl SignedPrekey {
    /// Generate a fresh prekey and sign its public key.
    pub fn generate(id: u32, signing: &SigningKeyPair) -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let signature = signing.sign(PublicKey::from(&secret).as_bytes()).to_bytes();
        Self {
            id,
            secret,
            signature,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_LEN] {
        &self.signature
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Serialize for the keychain.
    pub fn to_record_bytes(&self) -> zeroize::Zeroizing<Vec<u8>> {
        let mut buf = zeroize::Zeroizing::new(Vec::with_capacity(SIGNED_PREKEY_RECORD_LEN));
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(self.secret.as_bytes());
        buf.extend_from_slice(&self.signature);
        buf
    }

    /// Deserialize from the keychain record format.
    pub fn from_record_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SIGNED_PREKEY_RECORD_LEN {
            return Err(CryptoError::PreKeyError(format!(
                "signed prekey record has {} bytes",
                bytes.len()
            )));
        }
        let id = u32::from_le_bytes(
            bytes[..4]
                .try_into()
                .map_err(|_| CryptoError::PreKeyError("corrupt signed prekey id".into()))?,
        );
        let secret: [u8; 32] = bytes[4..36]
            .try_into()
            .map_err(|_| CryptoError::PreKeyError("corrupt signed prekey".into()))?;
        let signature: [u8; SIGNATURE_LEN] = bytes[36..]
            .try_into()
            .map_err(|_| CryptoError::PreKeyError("corrupt signed prekey signature".into()))?;
        Ok(Self {
            id,
            secret: StaticSecret::from(secret),
            signature,
        })
    }
}

/// A single-use prekey held in the local pool.
#[derive(ZeroizeOnDrop)]
pub struct OneTimePrekey {
    #[zeroize(skip)]
    pub id: u32,
    secret: StaticSecret,
}

impl OneTimePrekey {
    pub fn generate(id: u32) -> Self {
        Self {
            id,
            secret: StaticSecret::random_from_rng(rand::rngs::OsRng),
        }
    }

    pub fn from_secret_slice(id: u32, bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::PreKeyError(format!("one-time prekey {id} wrong length")))?;
        Ok(Self {
            id,
            secret: StaticSecret::from(secret),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.secret)
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

/// Public half of a one-time prekey as it appears in a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicOneTimePrekey {
    pub id: u32,
    pub public_key: Vec<u8>,
}

/// The shareable public key bundle for an account.
///
/// Contains no private material; safe to publish to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    /// X25519 identity public key.
    pub identity_key: Vec<u8>,
    /// Ed25519 public key that signs the signed prekey.
    pub signing_key: Vec<u8>,
    pub signed_prekey_id: u32,
    /// X25519 signed prekey (public).
    pub signed_prekey: Vec<u8>,
    /// Ed25519 signature over `signed_prekey`.
    pub signed_prekey_signature: Vec<u8>,
    /// Available one-time prekeys, ascending by id.
    pub one_time_prekeys: Vec<PublicOneTimePrekey>,
}

impl KeyBundle {
    /// Check the signed prekey signature under the bundle's signing key.
    pub fn verify_signed_prekey(&self) -> Result<(), CryptoError> {
        SigningKeyPair::verify(
            &self.signing_key,
            &self.signed_prekey,
            &self.signed_prekey_signature,
        )
    }

    pub fn one_time_prekey_ids(&self) -> Vec<u32> {
        self.one_time_prekeys.iter().map(|k| k.id).collect()
    }
}

/// Outcome of a key-manager call: the current bundle plus which categories
/// of key material were freshly generated (callers republish on any `true`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGenerationResult {
    pub bundle: KeyBundle,
    pub identity_updated: bool,
    pub signed_prekey_updated: bool,
    pub one_time_prekeys_updated: bool,
}

impl KeyGenerationResult {
    pub fn any_updated(&self) -> bool {
        self.identity_updated || self.signed_prekey_updated || self.one_time_prekeys_updated
    }
}
