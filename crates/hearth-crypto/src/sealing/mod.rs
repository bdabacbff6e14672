//! Per-object key derivation and AEAD sealing for messages and attachments.
//!
//! Every sealed object gets a fresh 32-byte salt; its key is
//! `HKDF-SHA256(ikm = root key, salt, info = context)` and is wiped right
//! after use. Encryption is XChaCha20-Poly1305 (24-byte nonce, 16-byte tag).

pub mod attachment;
pub mod cache;
pub mod message;

use base64::Engine as _;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::session::RootKey;

pub(crate) const SALT_LEN: usize = 32;
pub(crate) const NONCE_LEN: usize = 24;
pub(crate) const TAG_LEN: usize = 16;

pub(crate) fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Derive the one-shot object key for a given salt and context.
pub(crate) fn derive_object_key(
    root: &RootKey,
    salt: &[u8],
    info: &[u8],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), root.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(info, &mut key[..])
        .map_err(|e| CryptoError::EncryptionError(format!("HKDF expand failed: {e}")))?;
    Ok(key)
}

/// Unambiguous encoding of context fields: `label || (len u32 LE || bytes)*`.
///
/// Length prefixes keep `("ab", "c")` and `("a", "bc")` distinct.
pub(crate) fn context_bytes(label: &[u8], fields: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        label.len() + fields.iter().map(|f| f.len() + 4).sum::<usize>(),
    );
    out.extend_from_slice(label);
    for field in fields {
        let len = u32::try_from(field.len()).unwrap_or(u32::MAX);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(field);
    }
    out
}

pub(crate) fn encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub(crate) fn decode_exact(field: &str, value: &str, len: usize) -> Result<Vec<u8>, CryptoError> {
    let bytes = decode(field, value)?;
    if bytes.len() != len {
        return Err(CryptoError::MalformedPayload(format!(
            "{field} has {} bytes, expected {len}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

pub(crate) fn decode(field: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|_| CryptoError::MalformedPayload(format!("{field} is not valid base64")))
}
