//! Message sealing.
//!
//! The message key is bound to `(scheme version, target, message type)` and
//! the AEAD associated data to `(sender, type, target, version, readers)`.
//! Changing the reader set therefore invalidates the tag, which is why read
//! receipts trigger a full re-seal rather than an in-place patch.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use super::{
    context_bytes, decode, decode_exact, derive_object_key, encode, random_bytes, NONCE_LEN,
    SALT_LEN, TAG_LEN,
};
use crate::error::CryptoError;
use crate::session::SessionKeyInfo;

const MESSAGE_KEY_LABEL: &[u8] = b"hearth-message-key-v1";
const MESSAGE_AD_LABEL: &[u8] = b"hearth-message-ad-v1";

/// Sealed logical content of a message. Lives only in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn attachment(path: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            text: None,
            attachment_path: Some(path.into()),
            mime_type: Some(mime_type.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    File,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "file" | "attachment" => Some(Self::File),
            _ => None,
        }
    }

    pub fn is_media(self) -> bool {
        matches!(self, Self::Image)
    }
}

/// Context bound into a sealed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionMetadata {
    pub sender_id: String,
    pub message_type: MessageType,
    pub encryption_target: String,
    pub scheme_version: u32,
    /// Reader ids; order and duplicates do not matter.
    pub read_by: Vec<String>,
}

impl EncryptionMetadata {
    /// Metadata for a new message in the given session.
    pub fn for_session(info: &SessionKeyInfo, sender_id: &str, message_type: MessageType) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            message_type,
            encryption_target: info.encryption_target.clone(),
            scheme_version: info.scheme_version,
            read_by: Vec::new(),
        }
    }

    pub fn with_readers(&self, read_by: &[String]) -> Self {
        Self {
            read_by: read_by.to_vec(),
            ..self.clone()
        }
    }

    /// Sorted, de-duplicated reader ids.
    pub fn canonical_readers(&self) -> Vec<&str> {
        let mut readers: Vec<&str> = self.read_by.iter().map(String::as_str).collect();
        readers.sort_unstable();
        readers.dedup();
        readers
    }

    /// Canonical readers, each length-prefixed so no two sets share an
    /// encoding.
    fn readers_field(&self) -> Vec<u8> {
        let readers: Vec<&[u8]> = self
            .canonical_readers()
            .into_iter()
            .map(str::as_bytes)
            .collect();
        context_bytes(&[], &readers)
    }

    fn key_info(&self) -> Vec<u8> {
        context_bytes(
            MESSAGE_KEY_LABEL,
            &[
                &self.scheme_version.to_le_bytes(),
                self.encryption_target.as_bytes(),
                self.message_type.as_str().as_bytes(),
            ],
        )
    }

    fn associated_data(&self) -> Vec<u8> {
        context_bytes(
            MESSAGE_AD_LABEL,
            &[
                self.sender_id.as_bytes(),
                self.message_type.as_str().as_bytes(),
                self.encryption_target.as_bytes(),
                &self.scheme_version.to_le_bytes(),
                &self.readers_field(),
            ],
        )
    }
}

/// Everything needed to reopen a sealed message, base64 encoded for storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionPayload {
    pub ciphertext: String,
    pub nonce: String,
    pub salt: String,
    pub scheme_version: u32,
    pub encryption_target: String,
}

/// Result of opening a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened(MessageBody),
    /// The session has no root key; the conversation must be resynced.
    ResyncRequired,
    /// The payload is undecryptable. `code` is a sanitized error tag.
    Unavailable { code: &'static str },
}

impl OpenOutcome {
    pub fn body(&self) -> Option<&MessageBody> {
        match self {
            Self::Opened(body) => Some(body),
            _ => None,
        }
    }

    pub fn into_body(self) -> Option<MessageBody> {
        match self {
            Self::Opened(body) => Some(body),
            _ => None,
        }
    }
}

/// Seal a message body. All-or-nothing: on error nothing is produced.
pub fn seal(
    info: &SessionKeyInfo,
    body: &MessageBody,
    metadata: &EncryptionMetadata,
) -> Result<EncryptionPayload, CryptoError> {
    let root = info.root_key.as_ref().ok_or(CryptoError::MissingRootKey)?;

    let mut salt = random_bytes::<SALT_LEN>();
    let nonce = random_bytes::<NONCE_LEN>();
    let key = derive_object_key(root, &salt, &metadata.key_info())?;

    let plaintext = Zeroizing::new(
        serde_json::to_vec(body)
            .map_err(|e| CryptoError::EncryptionError(format!("serialize body: {e}")))?,
    );
    let cipher = XChaCha20Poly1305::new_from_slice(&key[..])
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    let aad = metadata.associated_data();
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext.as_slice(),
                aad: aad.as_slice(),
            },
        )
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    drop(key);

    let payload = EncryptionPayload {
        ciphertext: encode(&ciphertext),
        nonce: encode(&nonce),
        salt: encode(&salt),
        scheme_version: metadata.scheme_version,
        encryption_target: metadata.encryption_target.clone(),
    };
    salt.zeroize();
    Ok(payload)
}

/// Open a sealed message, classifying failures instead of erroring.
pub fn open(
    info: &SessionKeyInfo,
    payload: &EncryptionPayload,
    metadata: &EncryptionMetadata,
) -> OpenOutcome {
    if info.root_key.is_none() {
        tracing::debug!(room = %info.room_id, "message open needs resync: no root key");
        return OpenOutcome::ResyncRequired;
    }
    match try_open(info, payload, metadata) {
        Ok(body) => OpenOutcome::Opened(body),
        Err(e) => {
            tracing::warn!(room = %info.room_id, error = e.tag(), "message unavailable");
            OpenOutcome::Unavailable { code: e.tag() }
        }
    }
}

/// Like [`open`] but returns the raw error.
pub fn try_open(
    info: &SessionKeyInfo,
    payload: &EncryptionPayload,
    metadata: &EncryptionMetadata,
) -> Result<MessageBody, CryptoError> {
    let root = info.root_key.as_ref().ok_or(CryptoError::MissingRootKey)?;

    let salt = Zeroizing::new(decode_exact("salt", &payload.salt, SALT_LEN)?);
    let nonce = decode_exact("nonce", &payload.nonce, NONCE_LEN)?;
    let ciphertext = decode("ciphertext", &payload.ciphertext)?;
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::MalformedPayload("ciphertext shorter than tag".into()));
    }

    let key = derive_object_key(root, &salt, &metadata.key_info())?;
    let cipher = XChaCha20Poly1305::new_from_slice(&key[..])
        .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;
    let aad = metadata.associated_data();
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext.as_slice(),
                    aad: aad.as_slice(),
                },
            )
            .map_err(|_| CryptoError::DecryptionError("authentication failed".into()))?,
    );

    serde_json::from_slice(&plaintext)
        .map_err(|_| CryptoError::MalformedPayload("body is not valid JSON".into()))
}

/// Re-seal an opened message under an updated reader set.
///
/// Always derives a fresh salt and key. Returns `None` when there is no root
/// key or no plaintext body to re-seal (e.g. a legacy plaintext message).
pub fn reseal_with_updated_read_receipts(
    info: &SessionKeyInfo,
    body: Option<&MessageBody>,
    metadata: &EncryptionMetadata,
    read_by: &[String],
) -> Result<Option<EncryptionPayload>, CryptoError> {
    let Some(body) = body else {
        return Ok(None);
    };
    if info.root_key.is_none() {
        return Ok(None);
    }
    seal(info, body, &metadata.with_readers(read_by)).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{RootKey, SessionKeyInfo};

    fn direct_info() -> SessionKeyInfo {
        SessionKeyInfo::for_direct("room-1", "alice", "bob", RootKey::from_bytes([3u8; 32]), 1)
    }

    fn metadata(info: &SessionKeyInfo, readers: &[&str]) -> EncryptionMetadata {
        let mut meta = EncryptionMetadata::for_session(info, "alice", MessageType::Text);
        meta.read_by = readers.iter().map(|r| (*r).to_string()).collect();
        meta
    }

    fn flip_base64(value: &str, index: usize) -> String {
        let mut bytes = decode("field", value).unwrap();
        bytes[index] ^= 0x01;
        encode(&bytes)
    }

    #[test]
    fn seal_open_roundtrip() {
        let info = direct_info();
        let meta = metadata(&info, &["alice"]);
        let body = MessageBody::text("hello bob");

        let payload = seal(&info, &body, &meta).unwrap();
        assert_eq!(payload.encryption_target, "direct:bob");
        assert_eq!(payload.scheme_version, 1);
        assert_eq!(open(&info, &payload, &meta), OpenOutcome::Opened(body));
    }

    #[test]
    fn each_seal_uses_fresh_salt_and_nonce() {
        let info = direct_info();
        let meta = metadata(&info, &[]);
        let body = MessageBody::text("same");

        let a = seal(&info, &body, &meta).unwrap();
        let b = seal(&info, &body, &meta).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn seal_without_root_key_is_rejected() {
        let info = SessionKeyInfo::reauth_required("room-1", "alice", None);
        let meta = metadata(&info, &[]);
        let result = seal(&info, &MessageBody::text("x"), &meta);
        assert!(matches!(result, Err(CryptoError::MissingRootKey)));
    }

    #[test]
    fn open_without_root_key_requires_resync() {
        let info = direct_info();
        let meta = metadata(&info, &[]);
        let payload = seal(&info, &MessageBody::text("x"), &meta).unwrap();

        let stale = SessionKeyInfo::reauth_required("room-1", "alice", Some("bob"));
        assert_eq!(open(&stale, &payload, &meta), OpenOutcome::ResyncRequired);
    }

    #[test]
    fn tampered_payload_fields_fail() {
        let info = direct_info();
        let meta = metadata(&info, &["alice"]);
        let payload = seal(&info, &MessageBody::text("tamper me"), &meta).unwrap();

        let mut bad_ct = payload.clone();
        bad_ct.ciphertext = flip_base64(&payload.ciphertext, 0);
        let mut bad_tag = payload.clone();
        let ct_len = decode("ct", &payload.ciphertext).unwrap().len();
        bad_tag.ciphertext = flip_base64(&payload.ciphertext, ct_len - 1);
        let mut bad_nonce = payload.clone();
        bad_nonce.nonce = flip_base64(&payload.nonce, 5);
        let mut bad_salt = payload.clone();
        bad_salt.salt = flip_base64(&payload.salt, 31);

        for tampered in [bad_ct, bad_tag, bad_nonce, bad_salt] {
            assert_eq!(
                open(&info, &tampered, &meta),
                OpenOutcome::Unavailable {
                    code: "DecryptionError"
                }
            );
        }
    }

    #[test]
    fn tampered_associated_data_fails() {
        let info = direct_info();
        let meta = metadata(&info, &["alice"]);
        let payload = seal(&info, &MessageBody::text("bound"), &meta).unwrap();

        let mut sender = meta.clone();
        sender.sender_id = "mallory".into();
        let mut kind = meta.clone();
        kind.message_type = MessageType::Image;
        let mut target = meta.clone();
        target.encryption_target = "direct:carol".into();
        let mut version = meta.clone();
        version.scheme_version = 2;

        for altered in [sender, kind, target, version] {
            assert!(open(&info, &payload, &altered).body().is_none());
        }
    }

    #[test]
    fn reader_set_is_bound() {
        let info = direct_info();
        let only_a = metadata(&info, &["a"]);
        let a_and_b = metadata(&info, &["a", "b"]);
        let body = MessageBody::text("receipts");

        let sealed_a = seal(&info, &body, &only_a).unwrap();
        let sealed_ab = seal(&info, &body, &a_and_b).unwrap();

        assert!(open(&info, &sealed_a, &a_and_b).body().is_none());
        assert!(open(&info, &sealed_ab, &only_a).body().is_none());
        assert_eq!(open(&info, &sealed_ab, &a_and_b).body(), Some(&body));
    }

    #[test]
    fn reader_order_and_duplicates_do_not_matter() {
        let info = direct_info();
        let body = MessageBody::text("order");
        let sealed = seal(&info, &body, &metadata(&info, &["b", "a"])).unwrap();
        let reordered = metadata(&info, &["a", "b", "a"]);
        assert_eq!(open(&info, &sealed, &reordered).body(), Some(&body));
    }

    #[test]
    fn reader_boundaries_are_bound() {
        let info = direct_info();
        let body = MessageBody::text("x");
        let sealed = seal(&info, &body, &metadata(&info, &["a", "b"])).unwrap();
        assert!(open(&info, &sealed, &metadata(&info, &["a,b"])).body().is_none());
        assert!(open(&info, &sealed, &metadata(&info, &["ab"])).body().is_none());
        assert_eq!(
            metadata(&info, &["b", "a", "b"]).canonical_readers(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn malformed_payload_is_unavailable_not_resync() {
        let info = direct_info();
        let meta = metadata(&info, &[]);
        let mut payload = seal(&info, &MessageBody::text("x"), &meta).unwrap();
        payload.nonce = "not-base64!".into();

        assert_eq!(
            open(&info, &payload, &meta),
            OpenOutcome::Unavailable {
                code: "MalformedPayload"
            }
        );
    }

    #[test]
    fn reseal_produces_new_payload_for_new_readers() {
        let info = direct_info();
        let meta = metadata(&info, &["alice"]);
        let body = MessageBody::text("read me");
        let original = seal(&info, &body, &meta).unwrap();

        let readers = vec!["alice".to_string(), "bob".to_string()];
        let resealed = reseal_with_updated_read_receipts(&info, Some(&body), &meta, &readers)
            .unwrap()
            .unwrap();
        assert_ne!(resealed.salt, original.salt);

        let updated = meta.with_readers(&readers);
        assert_eq!(open(&info, &resealed, &updated).body(), Some(&body));
        assert!(open(&info, &resealed, &meta).body().is_none());
    }

    #[test]
    fn reseal_skips_without_body_or_key() {
        let info = direct_info();
        let meta = metadata(&info, &[]);
        let readers = vec!["bob".to_string()];

        assert!(reseal_with_updated_read_receipts(&info, None, &meta, &readers)
            .unwrap()
            .is_none());

        let stale = SessionKeyInfo::reauth_required("room-1", "alice", Some("bob"));
        let body = MessageBody::text("x");
        assert!(reseal_with_updated_read_receipts(&stale, Some(&body), &meta, &readers)
            .unwrap()
            .is_none());
    }

    #[test]
    fn group_and_direct_keys_do_not_cross() {
        let direct = direct_info();
        let group = SessionKeyInfo::for_group("room-1", "alice");
        let meta = metadata(&direct, &[]);
        let payload = seal(&direct, &MessageBody::text("x"), &meta).unwrap();
        assert!(open(&group, &payload, &meta).body().is_none());
    }

    #[test]
    fn message_type_parsing() {
        assert_eq!(MessageType::parse("TEXT"), Some(MessageType::Text));
        assert_eq!(MessageType::parse("attachment"), Some(MessageType::File));
        assert_eq!(MessageType::parse("sticker"), None);
    }
}
