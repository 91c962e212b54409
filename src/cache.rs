//! Response cache with TTL expiry and batched LRU eviction
//!
//! Entries live in a pluggable [`CacheStorage`]. The manager owns the policy:
//! expiry on read, capacity enforcement on write, periodic purging of expired
//! entries and hit/miss accounting. Storage failures never surface to the
//! caller; they are logged and treated as a miss or a skipped write.

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Share of entries dropped per eviction pass
const EVICTION_RATIO: usize = 10;

/// Cached response entry with expiration and access tracking
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub data: Value,
    pub created_at: Instant,
    pub expire_at: Instant,
    pub access_count: u64,
    pub last_access: Instant,
}

impl CacheEntry {
    pub fn new(data: Value, ttl: Duration) -> Self {
        let now = Instant::now();
        CacheEntry {
            data,
            created_at: now,
            expire_at: now + ttl,
            access_count: 0,
            last_access: now,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expire_at <= now
    }
}

/// Failure reported by a storage backend
#[derive(Error, Debug, Clone)]
#[error("Cache storage error: {0}")]
pub struct StorageError(pub String);

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Backing store for cache entries
pub trait CacheStorage: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<CacheEntry>>;

    fn set(&self, key: &str, entry: CacheEntry) -> StorageResult<()>;

    /// Remove an entry, returning whether it existed
    fn remove(&self, key: &str) -> StorageResult<bool>;

    fn keys(&self) -> StorageResult<Vec<String>>;

    fn clear(&self) -> StorageResult<()>;

    fn len(&self) -> StorageResult<usize> {
        Ok(self.keys()?.len())
    }

    /// Record a read of `key`
    fn touch(&self, key: &str, now: Instant) -> StorageResult<()> {
        if let Some(mut entry) = self.get(key)? {
            entry.access_count += 1;
            entry.last_access = now;
            self.set(key, entry)?;
        }
        Ok(())
    }
}

/// In-process storage backed by a `HashMap`
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStorage for MemoryStorage {
    fn get(&self, key: &str) -> StorageResult<Option<CacheEntry>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, entry: CacheEntry) -> StorageResult<()> {
        self.entries.write().insert(key.to_string(), entry);
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    fn clear(&self) -> StorageResult<()> {
        self.entries.write().clear();
        Ok(())
    }

    fn len(&self) -> StorageResult<usize> {
        Ok(self.entries.read().len())
    }

    fn touch(&self, key: &str, now: Instant) -> StorageResult<()> {
        if let Some(entry) = self.entries.write().get_mut(key) {
            entry.access_count += 1;
            entry.last_access = now;
        }
        Ok(())
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_items: usize,
    /// Approximate serialized size of all entries in bytes, refreshed lazily
    pub size: usize,
    /// Hits over lookups, 0.0 when nothing was looked up yet
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Copy)]
struct CacheLimits {
    ttl: Duration,
    max_size: usize,
}

#[derive(Debug, Default)]
struct SizeBookkeeping {
    size_bytes: usize,
    refreshed_at: Option<Instant>,
}

/// Cache manager enforcing TTL and capacity over a [`CacheStorage`]
pub struct CacheManager {
    storage: Arc<dyn CacheStorage>,
    limits: RwLock<CacheLimits>,
    hits: AtomicU64,
    misses: AtomicU64,
    bookkeeping: Mutex<SizeBookkeeping>,
    stats_refresh: Duration,
    /// Serializes capacity check, eviction and insert
    writes: Mutex<()>,
}

impl CacheManager {
    /// Create an in-memory cache
    ///
    /// # Arguments
    /// * `ttl` - Default time-to-live for entries
    /// * `max_size` - Maximum number of entries
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self::with_storage(Arc::new(MemoryStorage::new()), ttl, max_size)
    }

    /// Create a cache over a custom storage backend
    pub fn with_storage(storage: Arc<dyn CacheStorage>, ttl: Duration, max_size: usize) -> Self {
        CacheManager {
            storage,
            limits: RwLock::new(CacheLimits { ttl, max_size }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bookkeeping: Mutex::new(SizeBookkeeping::default()),
            stats_refresh: Duration::from_secs(1),
            writes: Mutex::new(()),
        }
    }

    /// Set how often the size estimate is recomputed
    pub fn with_stats_refresh(mut self, interval: Duration) -> Self {
        self.stats_refresh = interval;
        self
    }

    /// Change the default TTL and capacity; shrinking evicts immediately
    pub fn update_limits(&self, ttl: Duration, max_size: usize) {
        let _writes = self.writes.lock();
        *self.limits.write() = CacheLimits { ttl, max_size };
        let len = self.len();
        if len > max_size {
            self.evict_lru(len, max_size);
        }
    }

    pub fn max_size(&self) -> usize {
        self.limits.read().max_size
    }

    /// Look up an entry
    ///
    /// # Returns
    /// * `Some(Value)` on a live hit (access metadata is updated)
    /// * `None` on a miss, an expired entry (which is evicted) or a storage error
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();

        let result = match self.storage.get(key) {
            Ok(Some(entry)) => {
                if entry.is_expired(now) {
                    debug!("Cache entry expired: key={}", key);
                    if let Err(e) = self.storage.remove(key) {
                        warn!("Failed to evict expired cache entry: key={}, error={}", key, e);
                    }
                    None
                } else {
                    if let Err(e) = self.storage.touch(key, now) {
                        warn!("Failed to update cache access time: key={}, error={}", key, e);
                    }
                    Some(entry.data)
                }
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Cache lookup error: key={}, error={}", key, e);
                None
            }
        };

        if result.is_some() {
            debug!("Cache hit: key={}", key);
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!("Cache miss: key={}", key);
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        result
    }

    /// Store an entry, evicting the least recently used batch when full
    ///
    /// Failures are logged and swallowed.
    pub fn set(&self, key: &str, data: Value, ttl: Option<Duration>) {
        let _writes = self.writes.lock();
        let limits = *self.limits.read();
        let ttl = ttl.unwrap_or(limits.ttl);

        let exists = matches!(self.storage.get(key), Ok(Some(_)));
        if !exists {
            let len = self.len();
            if len >= limits.max_size {
                debug!(
                    "Cache size limit reached ({}/{}), evicting LRU entries",
                    len, limits.max_size
                );
                self.evict_lru(len, limits.max_size.saturating_sub(1));
            }
        }

        match self.storage.set(key, CacheEntry::new(data, ttl)) {
            Ok(()) => debug!("Stored cache entry: key={}, ttl={:?}", key, ttl),
            Err(e) => warn!("Failed to store cache entry: key={}, error={}", key, e),
        }
    }

    /// Remove a single entry
    pub fn remove(&self, key: &str) -> bool {
        match self.storage.remove(key) {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Failed to remove cache entry: key={}, error={}", key, e);
                false
            }
        }
    }

    /// Remove every entry
    pub fn clear(&self) {
        if let Err(e) = self.storage.clear() {
            warn!("Failed to clear cache: {}", e);
        }
        self.invalidate_bookkeeping();
    }

    /// Remove every entry whose key matches `pattern`
    ///
    /// # Returns
    /// Number of entries removed
    pub fn clear_by_pattern(&self, pattern: &Regex) -> usize {
        self.remove_where(|key, _| pattern.is_match(key))
    }

    /// Remove every entry whose key starts with `prefix`
    pub fn clear_by_prefix(&self, prefix: &str) -> usize {
        self.remove_where(|key, _| key.starts_with(prefix))
    }

    /// Drop expired entries regardless of access pattern
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let removed = self.remove_where(|_, entry| entry.is_expired(now));
        if removed > 0 {
            debug!("Purged {} expired cache entries", removed);
        }
        removed
    }

    /// Get cache statistics
    ///
    /// Counters are exact; `size` is recomputed at most once per refresh
    /// interval.
    pub fn get_stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            hits,
            misses,
            total_items: self.len(),
            size: self.size_estimate(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    /// Reset hit/miss counters
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        match self.storage.len() {
            Ok(len) => len,
            Err(e) => {
                warn!("Failed to count cache entries: {}", e);
                0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn size_estimate(&self) -> usize {
        let now = Instant::now();
        let mut bookkeeping = self.bookkeeping.lock();

        let fresh = bookkeeping
            .refreshed_at
            .map(|at| now.duration_since(at) < self.stats_refresh)
            .unwrap_or(false);
        if fresh {
            return bookkeeping.size_bytes;
        }

        let size_bytes = self
            .entries()
            .iter()
            .map(|(_, entry)| serde_json::to_vec(&entry.data).map(|v| v.len()).unwrap_or(0))
            .sum();

        bookkeeping.size_bytes = size_bytes;
        bookkeeping.refreshed_at = Some(now);
        size_bytes
    }

    fn invalidate_bookkeeping(&self) {
        let mut bookkeeping = self.bookkeeping.lock();
        bookkeeping.size_bytes = 0;
        bookkeeping.refreshed_at = None;
    }

    fn entries(&self) -> Vec<(String, CacheEntry)> {
        let keys = match self.storage.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Failed to list cache keys: {}", e);
                return Vec::new();
            }
        };

        keys.into_iter()
            .filter_map(|key| match self.storage.get(&key) {
                Ok(Some(entry)) => Some((key, entry)),
                _ => None,
            })
            .collect()
    }

    fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&str, &CacheEntry) -> bool,
    {
        let mut removed = 0;
        for (key, entry) in self.entries() {
            if predicate(&key, &entry) && self.remove(&key) {
                removed += 1;
            }
        }
        removed
    }

    /// Evict least recently used entries in one batch
    ///
    /// Drops at least a tenth of the current entries, and enough to bring
    /// the count down to `target`.
    fn evict_lru(&self, len: usize, target: usize) {
        let batch = (len / EVICTION_RATIO).max(1).max(len.saturating_sub(target));

        let mut entries: Vec<_> = self
            .entries()
            .into_iter()
            .map(|(key, entry)| (key, entry.last_access))
            .collect();
        entries.sort_by_key(|(_, last_access)| *last_access);

        let mut evicted = 0;
        for (key, _) in entries.into_iter().take(batch) {
            if self.remove(&key) {
                evicted += 1;
            }
        }

        debug!("LRU eviction: removed {} entries", evicted);
    }
}
