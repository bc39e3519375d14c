//! Cross-module cache behavior (§4.2): eviction order, the per-file size
//! cap, and counter bookkeeping, in the style of
//! `epheo-kiss/tests/cache_tests.rs`.

use std::time::SystemTime;

use xserver::cache::{CacheError, FileCache};

#[test]
fn evicts_least_recently_used_entry_once_budget_is_exceeded() {
    let cache = FileCache::new(1024, 20);
    cache.put("/a", vec![0u8; 10], SystemTime::now()).unwrap();
    cache.put("/b", vec![0u8; 10], SystemTime::now()).unwrap();
    // touch /a so /b becomes the least-recently-used entry
    assert!(cache.get("/a").is_some());
    cache.put("/c", vec![0u8; 10], SystemTime::now()).unwrap();

    assert!(cache.get("/b").is_none(), "/b should have been evicted to make room for /c");
    assert!(cache.get("/a").is_some());
    assert!(cache.get("/c").is_some());
    assert!(cache.total_bytes() <= 20);
}

#[test]
fn refuses_entries_over_the_per_file_cap_without_touching_the_budget() {
    let cache = FileCache::new(8, 4096);
    let before = cache.total_bytes();
    let err = cache.put("/huge", vec![0u8; 9], SystemTime::now()).unwrap_err();
    assert_eq!(err, CacheError::TooLarge);
    assert_eq!(cache.total_bytes(), before);
}

#[test]
fn invalidate_removes_an_entry_and_frees_its_bytes() {
    let cache = FileCache::new(1024, 4096);
    cache.put("/a", vec![0u8; 100], SystemTime::now()).unwrap();
    assert_eq!(cache.total_bytes(), 100);
    cache.invalidate("/a");
    assert_eq!(cache.total_bytes(), 0);
    assert!(cache.get("/a").is_none());
}

#[test]
fn replacing_an_entry_accounts_for_the_old_size() {
    let cache = FileCache::new(1024, 4096);
    cache.put("/a", vec![0u8; 50], SystemTime::now()).unwrap();
    cache.put("/a", vec![0u8; 10], SystemTime::now()).unwrap();
    assert_eq!(cache.total_bytes(), 10);
}

#[test]
fn hit_and_miss_counters_track_real_lookups() {
    let cache = FileCache::new(1024, 4096);
    assert!(cache.get("/missing").is_none());
    cache.put("/a", vec![1, 2, 3], SystemTime::now()).unwrap();
    assert!(cache.get("/a").is_some());
    assert!(cache.get("/a").is_some());
    assert_eq!(cache.hits(), 2);
    assert_eq!(cache.misses(), 1);
}
