//! Attachment sealing.
//!
//! The stored blob is `ciphertext || tag`; the tag is also recorded in the
//! metadata as `mac` so a download can be rejected before any decryption work.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use super::{
    context_bytes, decode_exact, derive_object_key, encode, random_bytes, NONCE_LEN, SALT_LEN,
    TAG_LEN,
};
use crate::error::CryptoError;
use crate::session::SessionKeyInfo;

const ATTACHMENT_KEY_LABEL: &[u8] = b"hearth-attachment-key-v1";
const ATTACHMENT_AD_LABEL: &[u8] = b"hearth-attachment-ad-v1";
const ATTACHMENT_KIND: &[u8] = b"attachment";

/// Download cap used when the metadata records no size: 15 MiB.
pub const DEFAULT_DOWNLOAD_CAP: u64 = 15 * 1024 * 1024;

/// What the message record stores about a sealed attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMetadata {
    pub storage_path: String,
    pub mime_type: String,
    pub nonce: String,
    pub salt: String,
    /// Base64 of the trailing 16-byte AEAD tag.
    pub mac: String,
    /// Stored blob length in bytes, tag included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub scheme_version: u32,
    pub encryption_target: String,
}

impl AttachmentMetadata {
    /// Maximum number of bytes to accept from the blob store.
    ///
    /// With a recorded size this is `max(size, tag length)`; otherwise
    /// `default_cap`.
    pub fn download_cap(&self, default_cap: u64) -> u64 {
        match self.size {
            Some(size) => size.max(TAG_LEN as u64),
            None => default_cap,
        }
    }

    fn key_info(&self) -> Vec<u8> {
        context_bytes(
            ATTACHMENT_KEY_LABEL,
            &[
                ATTACHMENT_KIND,
                &self.scheme_version.to_le_bytes(),
                self.encryption_target.as_bytes(),
                self.storage_path.as_bytes(),
            ],
        )
    }

    fn associated_data(&self) -> Vec<u8> {
        context_bytes(
            ATTACHMENT_AD_LABEL,
            &[
                ATTACHMENT_KIND,
                &self.scheme_version.to_le_bytes(),
                self.encryption_target.as_bytes(),
                self.mime_type.as_bytes(),
                self.storage_path.as_bytes(),
            ],
        )
    }
}

/// A sealed attachment: the blob to upload plus its record metadata.
#[derive(Debug, Clone)]
pub struct EncryptedAttachment {
    pub ciphertext: Vec<u8>,
    pub metadata: AttachmentMetadata,
}

/// Seal attachment bytes for upload to `storage_path`.
pub fn seal(
    info: &SessionKeyInfo,
    plaintext: &[u8],
    storage_path: &str,
    mime_type: &str,
) -> Result<EncryptedAttachment, CryptoError> {
    let root = info.root_key.as_ref().ok_or(CryptoError::MissingRootKey)?;

    let mut salt = random_bytes::<SALT_LEN>();
    let mut nonce = random_bytes::<NONCE_LEN>();
    let mut metadata = AttachmentMetadata {
        storage_path: storage_path.to_string(),
        mime_type: mime_type.to_string(),
        nonce: encode(&nonce),
        salt: encode(&salt),
        mac: String::new(),
        size: None,
        scheme_version: info.scheme_version,
        encryption_target: info.encryption_target.clone(),
    };

    let key = derive_object_key(root, &salt, &metadata.key_info())?;
    salt.zeroize();
    let cipher = XChaCha20Poly1305::new_from_slice(&key[..])
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    let aad = metadata.associated_data();
    let sealed = cipher.encrypt(
        XNonce::from_slice(&nonce),
        Payload {
            msg: plaintext,
            aad: aad.as_slice(),
        },
    );
    drop(key);
    nonce.zeroize();
    let ciphertext = sealed.map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

    let tag = &ciphertext[ciphertext.len() - TAG_LEN..];
    metadata.mac = encode(tag);
    metadata.size = Some(ciphertext.len() as u64);

    tracing::debug!(path = %storage_path, bytes = ciphertext.len(), "sealed attachment");
    Ok(EncryptedAttachment {
        ciphertext,
        metadata,
    })
}

/// Verify and open a downloaded attachment blob.
///
/// Checks run cheapest first: length, declared size, MAC, then AEAD.
pub fn open(
    metadata: &AttachmentMetadata,
    info: &SessionKeyInfo,
    blob: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let root = info.root_key.as_ref().ok_or(CryptoError::MissingRootKey)?;

    if blob.len() < TAG_LEN {
        return Err(CryptoError::CiphertextTooSmall { actual: blob.len() });
    }
    if let Some(declared) = metadata.size {
        if declared != blob.len() as u64 {
            return Err(CryptoError::SizeMismatch {
                declared,
                actual: blob.len() as u64,
            });
        }
    }
    verify_mac(metadata, blob)?;

    let salt = Zeroizing::new(decode_exact("salt", &metadata.salt, SALT_LEN)?);
    let nonce = Zeroizing::new(decode_exact("nonce", &metadata.nonce, NONCE_LEN)?);
    let key = derive_object_key(root, &salt, &metadata.key_info())?;
    let cipher = XChaCha20Poly1305::new_from_slice(&key[..])
        .map_err(|_| CryptoError::AttachmentDecryption)?;
    let aad = metadata.associated_data();
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce.as_slice()),
            Payload {
                msg: blob,
                aad: aad.as_slice(),
            },
        )
        .map_err(|_| CryptoError::AttachmentDecryption)?;
    Ok(Zeroizing::new(plaintext))
}

/// Constant-time comparison of the blob's trailing tag with the recorded MAC.
pub fn verify_mac(metadata: &AttachmentMetadata, blob: &[u8]) -> Result<(), CryptoError> {
    if blob.len() < TAG_LEN {
        return Err(CryptoError::CiphertextTooSmall { actual: blob.len() });
    }
    let expected = decode_exact("mac", &metadata.mac, TAG_LEN)?;
    let actual = &blob[blob.len() - TAG_LEN..];
    if bool::from(actual.ct_eq(expected.as_slice())) {
        Ok(())
    } else {
        Err(CryptoError::MacMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{RootKey, SessionKeyInfo};

    fn info() -> SessionKeyInfo {
        SessionKeyInfo::for_direct("room", "alice", "bob", RootKey::from_bytes([8u8; 32]), 1)
    }

    #[test]
    fn seal_open_roundtrip() {
        let info = info();
        let sealed = seal(&info, b"picture bytes", "rooms/room/a.jpg", "image/jpeg").unwrap();

        assert_eq!(sealed.metadata.size, Some(sealed.ciphertext.len() as u64));
        assert_eq!(
            super::super::decode("mac", &sealed.metadata.mac).unwrap(),
            sealed.ciphertext[sealed.ciphertext.len() - TAG_LEN..]
        );

        let opened = open(&sealed.metadata, &info, &sealed.ciphertext).unwrap();
        assert_eq!(opened.as_slice(), b"picture bytes");
    }

    #[test]
    fn empty_attachment_roundtrip() {
        let info = info();
        let sealed = seal(&info, b"", "p", "application/octet-stream").unwrap();
        assert_eq!(sealed.ciphertext.len(), TAG_LEN);
        assert!(open(&sealed.metadata, &info, &sealed.ciphertext).unwrap().is_empty());
    }

    #[test]
    fn too_small_blob_rejected() {
        let info = info();
        let sealed = seal(&info, b"x", "p", "text/plain").unwrap();
        let mut meta = sealed.metadata;
        meta.size = None;
        assert!(matches!(
            open(&meta, &info, &[0u8; 15]),
            Err(CryptoError::CiphertextTooSmall { actual: 15 })
        ));
    }

    #[test]
    fn size_mismatch_rejected() {
        let info = info();
        let sealed = seal(&info, b"abc", "p", "text/plain").unwrap();
        let mut blob = sealed.ciphertext.clone();
        blob.push(0);
        assert!(matches!(
            open(&sealed.metadata, &info, &blob),
            Err(CryptoError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn recorded_mac_mismatch_rejected_before_decryption() {
        let info = info();
        let sealed = seal(&info, b"abc", "p", "text/plain").unwrap();
        let mut meta = sealed.metadata.clone();
        meta.mac = encode(&[0u8; TAG_LEN]);
        // Even under the wrong root key the MAC gate fires first.
        let wrong_root =
            SessionKeyInfo::for_direct("room", "alice", "bob", RootKey::from_bytes([0u8; 32]), 1);
        assert!(matches!(
            open(&meta, &wrong_root, &sealed.ciphertext),
            Err(CryptoError::MacMismatch)
        ));
        assert!(matches!(
            open(&meta, &info, &sealed.ciphertext),
            Err(CryptoError::MacMismatch)
        ));
    }

    #[test]
    fn wrong_context_fails_aead() {
        let info = info();
        let sealed = seal(&info, b"abc", "p", "text/plain").unwrap();

        let mut other_path = sealed.metadata.clone();
        other_path.storage_path = "q".into();
        assert!(matches!(
            open(&other_path, &info, &sealed.ciphertext),
            Err(CryptoError::AttachmentDecryption)
        ));

        let mut other_mime = sealed.metadata.clone();
        other_mime.mime_type = "image/png".into();
        assert!(matches!(
            open(&other_mime, &info, &sealed.ciphertext),
            Err(CryptoError::AttachmentDecryption)
        ));
    }

    #[test]
    fn flipped_body_byte_fails_aead() {
        let info = info();
        let sealed = seal(&info, b"abcdef", "p", "text/plain").unwrap();
        let mut blob = sealed.ciphertext.clone();
        blob[0] ^= 0x80;
        assert!(matches!(
            open(&sealed.metadata, &info, &blob),
            Err(CryptoError::AttachmentDecryption)
        ));
    }

    #[test]
    fn download_cap_rules() {
        let info = info();
        let mut meta = seal(&info, b"abc", "p", "text/plain").unwrap().metadata;
        assert_eq!(meta.download_cap(DEFAULT_DOWNLOAD_CAP), 3 + TAG_LEN as u64);
        meta.size = Some(2);
        assert_eq!(meta.download_cap(DEFAULT_DOWNLOAD_CAP), TAG_LEN as u64);
        meta.size = None;
        assert_eq!(meta.download_cap(DEFAULT_DOWNLOAD_CAP), DEFAULT_DOWNLOAD_CAP);
    }

    #[test]
    fn missing_root_key_is_contract_violation() {
        let stale = SessionKeyInfo::reauth_required("room", "alice", None);
        assert!(matches!(
            seal(&stale, b"x", "p", "text/plain"),
            Err(CryptoError::MissingRootKey)
        ));
    }
}
