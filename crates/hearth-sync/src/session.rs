//! Session key resolution for rooms.
//!
//! Group rooms derive their root locally; direct rooms read the owner's
//! session record on every call. Nothing is cached here.

use std::sync::Arc;

use async_trait::async_trait;
use hearth_crypto::session::direct_target;
use hearth_crypto::{RootKey, SessionKeyInfo};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Per-room, per-participant session record in the remote session store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Base64 of the 32-byte root key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_key_material: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_uid: Option<String>,
    #[serde(default)]
    pub requires_reauth: bool,
}

#[async_trait]
pub trait SessionRecordSource: Send + Sync {
    async fn session_record(
        &self,
        room_id: &str,
        owner_uid: &str,
    ) -> Result<Option<SessionRecord>, SyncError>;
}

/// Turn a direct room's session record (if any) into key info.
pub fn resolve_direct(
    room_id: &str,
    owner_uid: &str,
    peer_uid: Option<&str>,
    record: Option<&SessionRecord>,
    default_version: u32,
) -> SessionKeyInfo {
    let Some(record) = record else {
        tracing::debug!(room = %room_id, "no session record, reauth required");
        return reauth(room_id, owner_uid, peer_uid, default_version);
    };

    let stored_peer = record
        .peer_uid
        .as_deref()
        .filter(|p| !p.is_empty())
        .or(peer_uid);

    if record.requires_reauth {
        tracing::debug!(room = %room_id, "session record flagged for reauth");
        return reauth(room_id, owner_uid, stored_peer, default_version);
    }
    let Some(root_key) = record
        .root_key_material
        .as_deref()
        .and_then(RootKey::from_base64)
    else {
        tracing::warn!(room = %room_id, "session record has unusable root key material");
        return reauth(room_id, owner_uid, stored_peer, default_version);
    };

    SessionKeyInfo {
        room_id: room_id.to_string(),
        owner_uid: owner_uid.to_string(),
        root_key: Some(root_key),
        scheme_version: record.protocol_version.unwrap_or(default_version),
        encryption_target: direct_target(stored_peer),
        requires_reauth: false,
    }
}

fn reauth(
    room_id: &str,
    owner_uid: &str,
    peer_uid: Option<&str>,
    version: u32,
) -> SessionKeyInfo {
    SessionKeyInfo {
        scheme_version: version,
        ..SessionKeyInfo::reauth_required(room_id, owner_uid, peer_uid)
    }
}

#[derive(Clone)]
pub struct SessionKeyResolver {
    source: Arc<dyn SessionRecordSource>,
    scheme_version: u32,
}

impl SessionKeyResolver {
    pub fn new(source: Arc<dyn SessionRecordSource>, scheme_version: u32) -> Self {
        Self {
            source,
            scheme_version,
        }
    }

    pub async fn resolve(
        &self,
        room_id: &str,
        owner_uid: &str,
        is_group: bool,
        peer_uid: Option<&str>,
    ) -> Result<SessionKeyInfo, SyncError> {
        if is_group {
            return Ok(SessionKeyInfo {
                scheme_version: self.scheme_version,
                ..SessionKeyInfo::for_group(room_id, owner_uid)
            });
        }
        let record = self.source.session_record(room_id, owner_uid).await?;
        Ok(resolve_direct(
            room_id,
            owner_uid,
            peer_uid,
            record.as_ref(),
            self.scheme_version,
        ))
    }
}
