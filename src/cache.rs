//! File content cache (C2, §4.2): path -> bytes, TTL/LRU eviction, bounded
//! total-bytes budget.
//!
//! Generalized from `epheo-kiss::main::{OptimizedCache, CacheEntry}` (that
//! crate precompiles a fixed, never-mutated cache at startup; here the
//! cache is live and continuously evicted, per §4.2) and from
//! `HFQR-xitca-web/http-file/src/date.rs` for `Last-Modified` formatting.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Instant, SystemTime},
};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

const IDLE_EVICT: std::time::Duration = std::time::Duration::from_secs(3600);

pub struct CacheEntry {
    pub bytes: Arc<[u8]>,
    pub mtime: SystemTime,
    last_access: Instant,
}

struct Bucket {
    entries: FxHashMap<String, CacheEntry>,
}

pub struct FileCache {
    max_file_size: u64,
    budget_bytes: u64,
    bucket: Mutex<Bucket>,
    total_bytes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CacheError {
    TooLarge,
}

impl FileCache {
    pub fn new(max_file_size: u64, budget_bytes: u64) -> Self {
        Self {
            max_file_size,
            budget_bytes,
            bucket: Mutex::new(Bucket { entries: FxHashMap::default() }),
            total_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, path: &str) -> Option<(Arc<[u8]>, SystemTime)> {
        let mut bucket = self.bucket.lock();
        if let Some(entry) = bucket.entries.get_mut(path) {
            entry.last_access = Instant::now();
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some((entry.bytes.clone(), entry.mtime));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, path: &str, bytes: Vec<u8>, mtime: SystemTime) -> Result<(), CacheError> {
        let size = bytes.len() as u64;
        if size > self.max_file_size {
            return Err(CacheError::TooLarge);
        }
        let mut bucket = self.bucket.lock();

        while self.total_bytes.load(Ordering::Relaxed) + size > self.budget_bytes && !bucket.entries.is_empty() {
            let victim = bucket
                .entries
                .iter()
                .min_by(|a, b| a.1.last_access.cmp(&b.1.last_access).then(a.1.mtime.cmp(&b.1.mtime)))
                .map(|(k, _)| k.clone());
            if let Some(key) = victim {
                if let Some(evicted) = bucket.entries.remove(&key) {
                    self.total_bytes.fetch_sub(evicted.bytes.len() as u64, Ordering::Relaxed);
                }
            } else {
                break;
            }
        }

        if let Some(old) = bucket.entries.insert(
            path.to_string(),
            CacheEntry { bytes: Arc::from(bytes.into_boxed_slice()), mtime, last_access: Instant::now() },
        ) {
            self.total_bytes.fetch_sub(old.bytes.len() as u64, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    pub fn invalidate(&self, path: &str) {
        let mut bucket = self.bucket.lock();
        if let Some(old) = bucket.entries.remove(path) {
            self.total_bytes.fetch_sub(old.bytes.len() as u64, Ordering::Relaxed);
        }
    }

    pub fn clear(&self) {
        let mut bucket = self.bucket.lock();
        bucket.entries.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
    }

    /// Background scan (§4.2): evict entries idle more than one hour.
    pub fn cleanup_idle(&self) {
        let now = Instant::now();
        let mut bucket = self.bucket.lock();
        let mut freed = 0u64;
        bucket.entries.retain(|_, e| {
            if now.duration_since(e.last_access) > IDLE_EVICT {
                freed += e.bytes.len() as u64;
                false
            } else {
                true
            }
        });
        if freed > 0 {
            self.total_bytes.fetch_sub(freed, Ordering::Relaxed);
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
