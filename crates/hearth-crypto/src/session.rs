//! Per-conversation root keys.
//!
//! Group rooms use a deterministic root derived from the room id; direct
//! rooms carry a negotiated root fetched from the session record. Resolving
//! the record itself is the caller's job (it lives behind the remote session
//! store).

use base64::Engine as _;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Current sealing scheme version.
pub const CURRENT_SCHEME_VERSION: u32 = 1;

const GROUP_ROOT_LABEL: &[u8] = b"hearth-group-root-v1";
const GROUP_TARGET_PREFIX: &str = "group:";
const DIRECT_TARGET_PREFIX: &str = "direct:";
const UNKNOWN_PEER: &str = "unknown";

/// A 32-byte conversation root secret. Wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RootKey([u8; 32]);

impl RootKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Decode base64 root material from a session record.
    ///
    /// Returns `None` for anything that is not exactly 32 bytes.
    pub fn from_base64(material: &str) -> Option<Self> {
        let mut decoded = base64::engine::general_purpose::STANDARD
            .decode(material.trim())
            .ok()?;
        let key = <[u8; 32]>::try_from(decoded.as_slice()).ok().map(Self);
        decoded.zeroize();
        key
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RootKey(..)")
    }
}

/// Everything the sealing engines need to know about a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeyInfo {
    pub room_id: String,
    pub owner_uid: String,
    /// Absent when the session must be re-established first.
    pub root_key: Option<RootKey>,
    pub scheme_version: u32,
    /// `"group:<room>"` or `"direct:<peer>"`.
    pub encryption_target: String,
    pub requires_reauth: bool,
}

impl SessionKeyInfo {
    /// Session info for a group room.
    ///
    /// The root is a public function of the room id (see [`group_root_key`]).
    pub fn for_group(room_id: &str, owner_uid: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            owner_uid: owner_uid.to_string(),
            root_key: Some(group_root_key(room_id)),
            scheme_version: CURRENT_SCHEME_VERSION,
            encryption_target: group_target(room_id),
            requires_reauth: false,
        }
    }

    /// Session info for a direct room whose key is usable.
    pub fn for_direct(
        room_id: &str,
        owner_uid: &str,
        peer_uid: &str,
        root_key: RootKey,
        scheme_version: u32,
    ) -> Self {
        Self {
            room_id: room_id.to_string(),
            owner_uid: owner_uid.to_string(),
            root_key: Some(root_key),
            scheme_version,
            encryption_target: direct_target(Some(peer_uid)),
            requires_reauth: false,
        }
    }

    /// Session info for a direct room that has no usable key yet.
    pub fn reauth_required(room_id: &str, owner_uid: &str, peer_uid: Option<&str>) -> Self {
        Self {
            room_id: room_id.to_string(),
            owner_uid: owner_uid.to_string(),
            root_key: None,
            scheme_version: CURRENT_SCHEME_VERSION,
            encryption_target: direct_target(peer_uid),
            requires_reauth: true,
        }
    }

    pub fn is_group(&self) -> bool {
        self.encryption_target.starts_with(GROUP_TARGET_PREFIX)
    }
}

/// Deterministic group root: `SHA-256(label || room_id)`.
///
/// Anyone who knows the room id can compute this; it gives format
/// consistency, not confidentiality.
pub fn group_root_key(room_id: &str) -> RootKey {
    let mut hasher = Sha256::new();
    hasher.update(GROUP_ROOT_LABEL);
    hasher.update(room_id.as_bytes());
    RootKey(hasher.finalize().into())
}

pub fn group_target(room_id: &str) -> String {
    format!("{GROUP_TARGET_PREFIX}{room_id}")
}

pub fn direct_target(peer_uid: Option<&str>) -> String {
    let peer = peer_uid.filter(|p| !p.is_empty()).unwrap_or(UNKNOWN_PEER);
    format!("{DIRECT_TARGET_PREFIX}{peer}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_root_is_deterministic() {
        let a = group_root_key("g1");
        let b = group_root_key("g1");
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), group_root_key("g2").as_bytes());
    }

    #[test]
    fn group_info_shape() {
        let info = SessionKeyInfo::for_group("g1", "alice");
        assert!(!info.requires_reauth);
        assert!(info.is_group());
        assert_eq!(info.encryption_target, "group:g1");
        assert_eq!(info.scheme_version, CURRENT_SCHEME_VERSION);
        assert_eq!(info.root_key, Some(group_root_key("g1")));
    }

    #[test]
    fn direct_target_falls_back_to_unknown() {
        assert_eq!(direct_target(Some("bob")), "direct:bob");
        assert_eq!(direct_target(Some("")), "direct:unknown");
        assert_eq!(direct_target(None), "direct:unknown");
    }

    #[test]
    fn root_key_base64_requires_32_bytes() {
        let encoded = base64::engine::general_purpose::STANDARD.encode([5u8; 32]);
        assert_eq!(
            RootKey::from_base64(&encoded).unwrap().as_bytes(),
            &[5u8; 32]
        );

        let short = base64::engine::general_purpose::STANDARD.encode([5u8; 31]);
        assert!(RootKey::from_base64(&short).is_none());
        assert!(RootKey::from_base64("not base64!").is_none());
        assert!(RootKey::from_base64("").is_none());
    }

    #[test]
    fn root_key_debug_is_redacted() {
        let rendered = format!("{:?}", RootKey::from_bytes([9u8; 32]));
        assert_eq!(rendered, "RootKey(..)");
    }
}
