//! In-process collaborators: a directory, session store and blob store kept
//! in memory. Used by tests and local tooling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::attachments::BlobStore;
use crate::directory::{DirectoryRecord, KeyDirectory};
use crate::error::SyncError;
use crate::session::{SessionRecord, SessionRecordSource};

#[derive(Default)]
pub struct MemoryDirectory {
    records: Mutex<HashMap<String, DirectoryRecord>>,
    writes: AtomicUsize,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a record wholesale, bypassing merge semantics.
    pub fn insert(&self, uid: &str, record: DirectoryRecord) {
        self.records.lock().insert(uid.to_string(), record);
    }

    pub fn remove(&self, uid: &str) {
        self.records.lock().remove(uid);
    }

    pub fn record(&self, uid: &str) -> Option<DirectoryRecord> {
        self.records.lock().get(uid).cloned()
    }

    /// Number of merge writes received.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl KeyDirectory for MemoryDirectory {
    async fn read_record(&self, uid: &str) -> Result<Option<DirectoryRecord>, SyncError> {
        Ok(self.record(uid))
    }

    async fn merge_record(&self, uid: &str, record: &DirectoryRecord) -> Result<(), SyncError> {
        self.records
            .lock()
            .entry(uid.to_string())
            .or_default()
            .merge(record);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    records: Mutex<HashMap<(String, String), SessionRecord>>,
    reads: AtomicUsize,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, room_id: &str, owner_uid: &str, record: SessionRecord) {
        self.records
            .lock()
            .insert((room_id.to_string(), owner_uid.to_string()), record);
    }

    pub fn remove(&self, room_id: &str, owner_uid: &str) {
        self.records
            .lock()
            .remove(&(room_id.to_string(), owner_uid.to_string()));
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SessionRecordSource for MemorySessionStore {
    async fn session_record(
        &self,
        room_id: &str,
        owner_uid: &str,
    ) -> Result<Option<SessionRecord>, SyncError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .records
            .lock()
            .get(&(room_id.to_string(), owner_uid.to_string()))
            .cloned())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob(&self, storage_path: &str) -> Option<Vec<u8>> {
        self.blobs.lock().get(storage_path).cloned()
    }

    pub fn replace(&self, storage_path: &str, bytes: Vec<u8>) {
        self.blobs.lock().insert(storage_path.to_string(), bytes);
    }

    pub fn remove(&self, storage_path: &str) {
        self.blobs.lock().remove(storage_path);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, storage_path: &str, bytes: Vec<u8>) -> Result<(), SyncError> {
        self.replace(storage_path, bytes);
        Ok(())
    }

    async fn fetch(&self, storage_path: &str, max_bytes: u64) -> Result<Vec<u8>, SyncError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let blobs = self.blobs.lock();
        let blob = blobs
            .get(storage_path)
            .ok_or_else(|| SyncError::BlobStore(format!("no blob at {storage_path}")))?;
        // Read at most one byte past the cap, like a bounded stream would.
        let limit = usize::try_from(max_bytes.saturating_add(1)).unwrap_or(usize::MAX);
        Ok(blob[..blob.len().min(limit)].to_vec())
    }
}
