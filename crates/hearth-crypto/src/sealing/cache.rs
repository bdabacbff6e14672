use std::collections::VecDeque;

use parking_lot::Mutex;
use zeroize::Zeroizing;

/// Default number of decrypted attachments kept in memory.
pub const DEFAULT_CAPACITY: usize = 8;

/// Bounded LRU of decrypted attachment plaintext, keyed by storage path.
///
/// Entries are wiped when evicted or cleared. Callers always get a copy,
/// never a view into the cached buffer.
pub struct AttachmentCache {
    capacity: usize,
    // Front is least recently used.
    entries: Mutex<VecDeque<(String, Zeroizing<Vec<u8>>)>>,
}

impl AttachmentCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of the cached plaintext, marking it most recently used.
    pub fn get(&self, storage_path: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|(path, _)| path == storage_path)?;
        let entry = entries.remove(index)?;
        let copy = entry.1.to_vec();
        entries.push_back(entry);
        Some(copy)
    }

    /// Cache a copy of `plaintext`, evicting the least recently used entry
    /// when full.
    pub fn insert(&self, storage_path: &str, plaintext: &[u8]) {
        let mut entries = self.entries.lock();
        if let Some(index) = entries.iter().position(|(path, _)| path == storage_path) {
            entries.remove(index);
        }
        while entries.len() >= self.capacity {
            if let Some((evicted, _buffer)) = entries.pop_front() {
                tracing::trace!(path = %evicted, "evicted attachment from cache");
            }
        }
        entries.push_back((storage_path.to_string(), Zeroizing::new(plaintext.to_vec())));
    }

    pub fn remove(&self, storage_path: &str) {
        self.entries.lock().retain(|(path, _)| path != storage_path);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for AttachmentCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
