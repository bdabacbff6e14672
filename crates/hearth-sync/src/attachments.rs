//! Attachment upload and download around the blob store.

use std::sync::Arc;

use async_trait::async_trait;
use hearth_crypto::sealing::attachment;
use hearth_crypto::{AttachmentCache, AttachmentMetadata, CryptoError, SessionKeyInfo};

use crate::error::SyncError;

/// Remote storage for encrypted attachment bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, storage_path: &str, bytes: Vec<u8>) -> Result<(), SyncError>;

    /// Download a blob. Implementations should stop reading once more than
    /// `max_bytes` have arrived; the caller rejects anything longer.
    async fn fetch(&self, storage_path: &str, max_bytes: u64) -> Result<Vec<u8>, SyncError>;
}

/// Seals, uploads, downloads and opens attachments, with a shared plaintext
/// cache in front of the blob store.
#[derive(Clone)]
pub struct AttachmentService {
    store: Arc<dyn BlobStore>,
    cache: Arc<AttachmentCache>,
    default_download_cap: u64,
}

impl AttachmentService {
    pub fn new(
        store: Arc<dyn BlobStore>,
        cache: Arc<AttachmentCache>,
        default_download_cap: u64,
    ) -> Self {
        Self {
            store,
            cache,
            default_download_cap,
        }
    }

    pub fn cache(&self) -> &Arc<AttachmentCache> {
        &self.cache
    }

    /// Seal `plaintext` and upload the ciphertext. Returns the metadata to
    /// store on the message record.
    pub async fn seal_and_upload(
        &self,
        info: &SessionKeyInfo,
        plaintext: Vec<u8>,
        storage_path: &str,
        mime_type: &str,
    ) -> Result<AttachmentMetadata, SyncError> {
        let sealed = {
            let info = info.clone();
            let storage_path = storage_path.to_string();
            let mime_type = mime_type.to_string();
            tokio::task::spawn_blocking(move || {
                let plaintext = zeroize::Zeroizing::new(plaintext);
                attachment::seal(&info, &plaintext, &storage_path, &mime_type)
            })
            .await??
        };
        self.store.put(storage_path, sealed.ciphertext).await?;
        tracing::debug!(path = %storage_path, "uploaded attachment");
        Ok(sealed.metadata)
    }

    /// Return the attachment plaintext, from cache when possible.
    pub async fn open(
        &self,
        metadata: &AttachmentMetadata,
        info: &SessionKeyInfo,
    ) -> Result<Vec<u8>, SyncError> {
        if info.root_key.is_none() {
            return Err(CryptoError::MissingRootKey.into());
        }
        if let Some(plaintext) = self.cache.get(&metadata.storage_path) {
            tracing::trace!(path = %metadata.storage_path, "attachment cache hit");
            return Ok(plaintext);
        }

        let cap = metadata.download_cap(self.default_download_cap);
        let blob = self.store.fetch(&metadata.storage_path, cap).await?;
        if blob.len() as u64 > cap {
            tracing::warn!(path = %metadata.storage_path, cap, "attachment download over cap");
            return Err(CryptoError::DownloadTooLarge { cap }.into());
        }

        let plaintext = {
            let metadata = metadata.clone();
            let info = info.clone();
            tokio::task::spawn_blocking(move || attachment::open(&metadata, &info, &blob)).await?
        };
        let plaintext = match plaintext {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::warn!(path = %metadata.storage_path, error = e.tag(), "attachment rejected");
                return Err(e.into());
            }
        };

        self.cache.insert(&metadata.storage_path, &plaintext);
        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlobStore;
    use hearth_crypto::RootKey;

    fn info() -> SessionKeyInfo {
        SessionKeyInfo::for_direct("dm", "alice", "bob", RootKey::from_bytes([6u8; 32]), 1)
    }

    fn service(store: &Arc<MemoryBlobStore>) -> AttachmentService {
        AttachmentService::new(store.clone(), Arc::new(AttachmentCache::new(2)), 1024)
    }

    #[tokio::test]
    async fn upload_then_open_uses_cache() {
        let store = Arc::new(MemoryBlobStore::new());
        let svc = service(&store);
        let meta = svc
            .seal_and_upload(&info(), b"photo".to_vec(), "dm/1.jpg", "image/jpeg")
            .await
            .unwrap();
        assert_ne!(store.blob("dm/1.jpg").unwrap(), b"photo");

        assert_eq!(svc.open(&meta, &info()).await.unwrap(), b"photo");
        assert_eq!(svc.open(&meta, &info()).await.unwrap(), b"photo");
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn oversized_download_rejected() {
        let store = Arc::new(MemoryBlobStore::new());
        let svc = service(&store);
        let mut meta = svc
            .seal_and_upload(&info(), vec![1u8; 2048], "big", "application/pdf")
            .await
            .unwrap();
        meta.size = None;

        let err = svc.open(&meta, &info()).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Crypto(CryptoError::DownloadTooLarge { cap: 1024 })
        ));
        assert!(svc.cache().is_empty());
    }

    #[tokio::test]
    async fn tampered_blob_fails_mac_gate_and_is_not_cached() {
        let store = Arc::new(MemoryBlobStore::new());
        let svc = service(&store);
        let meta = svc
            .seal_and_upload(&info(), b"doc".to_vec(), "doc", "text/plain")
            .await
            .unwrap();
        let mut blob = store.blob("doc").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 1;
        store.replace("doc", blob);

        let err = svc.open(&meta, &info()).await.unwrap_err();
        assert_eq!(err.tag(), "MacMismatch");
        assert!(svc.cache().get("doc").is_none());
    }

    #[tokio::test]
    async fn missing_blob_is_a_store_error() {
        let store = Arc::new(MemoryBlobStore::new());
        let svc = service(&store);
        let meta = svc
            .seal_and_upload(&info(), b"x".to_vec(), "gone", "text/plain")
            .await
            .unwrap();
        store.remove("gone");
        assert!(matches!(
            svc.open(&meta, &info()).await,
            Err(SyncError::BlobStore(_))
        ));
    }
}
