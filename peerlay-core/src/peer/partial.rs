//! Registry of in-flight downloads
//!
//! While a node is still downloading a file (from origin or a peer), the
//! entry registered here lets other peers stream the bytes that already
//! arrived. The HTTP server polls the registry between progressive sends;
//! the coordinator re-points entries at their final cache location once a
//! download completes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::http::{ProgressivePoll, ProgressiveSource};

use super::ContentHash;

struct PartialEntry {
    id: u64,
    path: PathBuf,
    expected_size: u64,
    hash: ContentHash,
    aborted: bool,
}

pub struct PartialFileRegistry {
    entries: Mutex<Vec<PartialEntry>>,
    next_id: AtomicU64,
}

impl Default for PartialFileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialFileRegistry {
    pub fn new() -> Self {
        // Id 0 is the "not progressive" sentinel on the HTTP side
        Self { entries: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) }
    }

    /// Track an in-flight download. Returns its handle.
    pub fn add(&self, path: &Path, expected_size: u64, hash: ContentHash) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().expect("partial registry lock poisoned").push(PartialEntry {
            id,
            path: path.to_path_buf(),
            expected_size,
            hash,
            aborted: false,
        });
        log::debug!("partial {} registered for {}", id, path.display());
        id
    }

    /// Look a hash up: handle, current on-disk size, expected size, path.
    pub fn find(&self, hash: &ContentHash) -> Option<(u64, PathBuf, u64, u64)> {
        let entries = self.entries.lock().expect("partial registry lock poisoned");
        let entry = entries.iter().find(|e| !e.aborted && e.hash == *hash)?;
        let current = std::fs::metadata(&entry.path).map(|m| m.len()).unwrap_or(0);
        Some((entry.id, entry.path.clone(), current, entry.expected_size))
    }

    /// Atomically swap the backing path (partial promoted to a cache file).
    pub fn change_file(&self, id: u64, new_path: &Path) -> bool {
        let mut entries = self.entries.lock().expect("partial registry lock poisoned");
        match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.path = new_path.to_path_buf();
                true
            }
            None => false,
        }
    }

    /// Flag the entry so in-flight progressive responses abort.
    pub fn abort(&self, id: u64) -> bool {
        let mut entries = self.entries.lock().expect("partial registry lock poisoned");
        match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.aborted = true;
                true
            }
            None => false,
        }
    }

    /// Drop the entry entirely.
    pub fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock().expect("partial registry lock poisoned");
        let before = entries.len();
        entries.retain(|e| e.id != id);
        before != entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("partial registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProgressiveSource for PartialFileRegistry {
    fn poll(&self, id: u64) -> ProgressivePoll {
        let entries = self.entries.lock().expect("partial registry lock poisoned");
        match entries.iter().find(|e| e.id == id) {
            Some(entry) if entry.aborted => ProgressivePoll::Aborted,
            Some(_) => ProgressivePoll::Growing,
            None => ProgressivePoll::Unknown,
        }
    }

    fn completed(&self, id: u64) {
        // The entry itself stays until the downloader removes it; other
        // responses may still be streaming from the same partial.
        log::debug!("progressive response over partial {} completed", id);
    }
}
