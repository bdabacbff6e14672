//! High-level E2EE client for one signed-in account.
//!
//! Key manager work (keychain I/O, key generation) and sealing run on the
//! blocking pool; directory, session and blob calls are awaited directly.

use std::sync::Arc;

use hearth_crypto::{
    AttachmentCache, AttachmentMetadata, CryptoError, KeyBundle, KeyGenerationResult, KeyManager,
    Keychain, MessageBody, MessageType, SessionKeyInfo,
};
use zeroize::Zeroizing;

use crate::attachments::{AttachmentService, BlobStore};
use crate::config::E2eeConfig;
use crate::directory::{BundleCache, KeyDirectory, KeyDirectoryClient};
use crate::error::SyncError;
use crate::mapper::{self, DecryptedMessage, OutgoingMessage, RawMessageRecord, ReadReceiptUpdate};
use crate::session::{SessionKeyResolver, SessionRecordSource};

/// Remote services the client talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn KeyDirectory>,
    pub sessions: Arc<dyn SessionRecordSource>,
    pub blobs: Arc<dyn BlobStore>,
}

pub struct E2eeClient {
    uid: String,
    config: E2eeConfig,
    keys: Arc<KeyManager>,
    directory: KeyDirectoryClient,
    resolver: SessionKeyResolver,
    attachments: AttachmentService,
}

impl E2eeClient {
    /// Load the account's key material and wire up collaborators. Nothing is
    /// generated or published until [`Self::bootstrap`].
    pub async fn open(
        uid: &str,
        keychain: Arc<dyn Keychain>,
        collaborators: Collaborators,
        config: E2eeConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let key_config = config.key_manager_config();
        let keys = tokio::task::spawn_blocking(move || KeyManager::load(keychain, key_config))
            .await??;

        Ok(Self {
            uid: uid.to_string(),
            directory: KeyDirectoryClient::new(
                collaborators.directory,
                Arc::new(BundleCache::new(config.directory_cache_capacity)),
            ),
            resolver: SessionKeyResolver::new(collaborators.sessions, config.scheme_version),
            attachments: AttachmentService::new(
                collaborators.blobs,
                Arc::new(AttachmentCache::new(config.attachment_cache_capacity)),
                config.attachment_download_cap,
            ),
            keys: Arc::new(keys),
            config,
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn config(&self) -> &E2eeConfig {
        &self.config
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn directory(&self) -> &KeyDirectoryClient {
        &self.directory
    }

    pub fn attachments(&self) -> &AttachmentService {
        &self.attachments
    }

    /// Run a key manager operation on the blocking pool.
    async fn key_call<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&KeyManager) -> Result<T, CryptoError> + Send + 'static,
    {
        let keys = Arc::clone(&self.keys);
        Ok(tokio::task::spawn_blocking(move || f(&keys)).await??)
    }

    /// Make sure a full key bundle exists and the directory has it.
    pub async fn bootstrap(&self) -> Result<KeyGenerationResult, SyncError> {
        let threshold = self.config.replenish_threshold;
        let result = self.key_call(move |keys| keys.ensure_key_bundle(threshold)).await?;
        let published = self.directory.publish_if_needed(&self.uid, &result).await?;
        tracing::info!(
            uid = %self.uid,
            generated = result.any_updated(),
            published,
            "key bundle ready"
        );
        Ok(result)
    }

    pub async fn rotate_signed_prekey(&self) -> Result<KeyGenerationResult, SyncError> {
        let result = self.key_call(KeyManager::rotate_signed_prekey).await?;
        self.directory.publish(&self.uid, &result.bundle).await?;
        Ok(result)
    }

    /// Refill the one-time prekey pool if it is low, republishing when it
    /// was. Returns whether a refill happened.
    pub async fn replenish_one_time_prekeys(&self) -> Result<bool, SyncError> {
        let threshold = self.config.replenish_threshold;
        let refilled = self
            .key_call(move |keys| keys.ensure_minimum_one_time_prekeys(threshold))
            .await?;
        match refilled {
            Some(result) => {
                self.directory.publish(&self.uid, &result.bundle).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Consume one of our one-time prekeys after a peer used it, then top the
    /// pool back up if needed. A consumed id is always withdrawn from the
    /// directory, refill or not.
    pub async fn consume_one_time_prekey(
        &self,
        id: u32,
    ) -> Result<Option<Zeroizing<[u8; 32]>>, SyncError> {
        let taken = self
            .key_call(move |keys| {
                Ok(keys
                    .take_one_time_prekey(id)?
                    .map(|secret| (secret, keys.current_bundle())))
            })
            .await?;
        let Some((secret, bundle)) = taken else {
            tracing::debug!(id, "one-time prekey not available");
            return Ok(None);
        };
        if !self.replenish_one_time_prekeys().await? {
            if let Some(bundle) = bundle {
                self.directory.publish(&self.uid, &bundle).await?;
            }
        }
        Ok(Some(secret))
    }

    pub async fn fetch_peer_bundle(&self, peer_uid: &str) -> Result<Option<KeyBundle>, SyncError> {
        self.directory.fetch(peer_uid).await
    }

    pub async fn session(
        &self,
        room_id: &str,
        is_group: bool,
        peer_uid: Option<&str>,
    ) -> Result<SessionKeyInfo, SyncError> {
        self.resolver
            .resolve(room_id, &self.uid, is_group, peer_uid)
            .await
    }

    /// Seal a message from this account.
    pub async fn seal_message(
        &self,
        info: &SessionKeyInfo,
        id: &str,
        body: MessageBody,
        message_type: MessageType,
        attachment: Option<AttachmentMetadata>,
    ) -> Result<RawMessageRecord, SyncError> {
        let outgoing = OutgoingMessage {
            id: id.to_string(),
            sender_id: self.uid.clone(),
            message_type,
            body,
            attachment,
        };
        let info = info.clone();
        Ok(tokio::task::spawn_blocking(move || mapper::seal_outgoing(&info, &outgoing)).await??)
    }

    pub async fn send_text(
        &self,
        info: &SessionKeyInfo,
        id: &str,
        text: &str,
    ) -> Result<RawMessageRecord, SyncError> {
        self.seal_message(info, id, MessageBody::text(text), MessageType::Text, None)
            .await
    }

    /// Seal and upload an attachment, then seal the message pointing at it.
    pub async fn send_attachment(
        &self,
        info: &SessionKeyInfo,
        id: &str,
        bytes: Vec<u8>,
        storage_path: &str,
        mime_type: &str,
    ) -> Result<RawMessageRecord, SyncError> {
        let metadata = self
            .attachments
            .seal_and_upload(info, bytes, storage_path, mime_type)
            .await?;
        let message_type = if mime_type.starts_with("image/") {
            MessageType::Image
        } else {
            MessageType::File
        };
        self.seal_message(
            info,
            id,
            MessageBody::attachment(storage_path, mime_type),
            message_type,
            Some(metadata),
        )
        .await
    }

    pub async fn read_message(
        &self,
        info: &SessionKeyInfo,
        record: &RawMessageRecord,
    ) -> Result<DecryptedMessage, SyncError> {
        let info = info.clone();
        let record = record.clone();
        Ok(tokio::task::spawn_blocking(move || mapper::map_record(&record, &info)).await?)
    }

    /// Record that this account read `record`. `body` is the opened body,
    /// needed to re-seal sealed records.
    pub async fn mark_read(
        &self,
        info: &SessionKeyInfo,
        record: &RawMessageRecord,
        body: Option<&MessageBody>,
    ) -> Result<Option<ReadReceiptUpdate>, SyncError> {
        let info = info.clone();
        let record = record.clone();
        let body = body.cloned();
        let reader = self.uid.clone();
        Ok(tokio::task::spawn_blocking(move || {
            mapper::apply_read_receipt(&record, &info, body.as_ref(), &reader)
        })
        .await??)
    }

    pub async fn open_attachment(
        &self,
        info: &SessionKeyInfo,
        metadata: &AttachmentMetadata,
    ) -> Result<Vec<u8>, SyncError> {
        self.attachments.open(metadata, info).await
    }
}
