//! TTL cache for keystore records.
//!
//! Records are immutable snapshots tagged with their version. An entry is
//! never replaced by a lower version, and a local write leaves a floor at the
//! committed version so a reader that fetched before the write cannot put
//! its older snapshot back. Entries expire after `cache-expiration`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::models::KeystoreRecord;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct KeystoreCacheConfig {
    /// How long a cached record is served
    pub ttl: Duration,

    /// Maximum number of cached records
    pub max_entries: usize,
}

impl Default for KeystoreCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            max_entries: 10_000,
        }
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

struct CachedRecord {
    /// `None` once invalidated; the entry then only holds the version floor
    record: Option<KeystoreRecord>,
    version: u64,
    expires_at: Instant,
    last_used: Instant,
}

impl CachedRecord {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Snapshot of cache statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

// =============================================================================
// Keystore Cache
// =============================================================================

pub struct KeystoreCache {
    entries: DashMap<String, CachedRecord>,
    config: KeystoreCacheConfig,
    stats: CacheStats,
}

impl KeystoreCache {
    pub fn new(config: KeystoreCacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            stats: CacheStats::default(),
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self::new(KeystoreCacheConfig {
            ttl,
            ..Default::default()
        })
    }

    /// Cache `record` unless a newer version, or a floor above it, is
    /// already held.
    pub fn insert(&self, record: KeystoreRecord) {
        if self.entries.len() >= self.config.max_entries && !self.entries.contains_key(&record.id) {
            self.evict_lru();
        }

        let now = Instant::now();
        let fresh = CachedRecord {
            version: record.version,
            record: None,
            expires_at: now + self.config.ttl,
            last_used: now,
        };

        match self.entries.entry(record.id.clone()) {
            Entry::Occupied(mut slot) => {
                let held = slot.get();
                if !held.is_expired() && held.version > record.version {
                    debug!(
                        keystore_id = %record.id,
                        held = held.version,
                        offered = record.version,
                        "Ignoring stale keystore snapshot"
                    );
                    return;
                }
                slot.insert(CachedRecord {
                    record: Some(record),
                    ..fresh
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(CachedRecord {
                    record: Some(record),
                    ..fresh
                });
            }
        }
    }

    /// Cached copy, or `None` when absent or expired.
    pub fn get(&self, id: &str) -> Option<KeystoreRecord> {
        if let Some(mut entry) = self.entries.get_mut(id) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(id);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            if let Some(record) = &entry.record {
                let record = record.clone();
                entry.last_used = Instant::now();
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(record);
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Drop the cached record and refuse snapshots older than
    /// `min_version` until the floor expires.
    pub fn invalidate(&self, id: &str, min_version: u64) {
        let now = Instant::now();
        let version = self
            .entries
            .get(id)
            .map(|held| held.version.max(min_version))
            .unwrap_or(min_version);
        self.entries.insert(
            id.to_string(),
            CachedRecord {
                record: None,
                version,
                expires_at: now + self.config.ttl,
                last_used: now,
            },
        );
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.is_expired());
        let removed = before.saturating_sub(self.entries.len());
        self.stats
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    fn evict_lru(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.last_used)
            .map(|e| e.key().clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> KeystoreRecord {
        KeystoreRecord::new(id.into(), "did:example:1".into(), "owner".into(), "cap".into())
    }

    fn versioned(id: &str, version: u64) -> KeystoreRecord {
        let mut record = record(id);
        record.version = version;
        record
    }

    #[test]
    fn test_insert_and_get() {
        let cache = KeystoreCache::new(KeystoreCacheConfig::default());
        cache.insert(record("ks-1"));

        assert_eq!(cache.get("ks-1").unwrap().id, "ks-1");
        assert!(cache.get("ks-2").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_expiry() {
        let cache = KeystoreCache::with_ttl(Duration::from_millis(10));
        cache.insert(record("ks-1"));
        assert!(cache.get("ks-1").is_some());

        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("ks-1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate() {
        let cache = KeystoreCache::new(KeystoreCacheConfig::default());
        cache.insert(record("ks-1"));
        cache.invalidate("ks-1", 1);
        assert!(cache.get("ks-1").is_none());
    }

    #[test]
    fn test_older_version_never_replaces_newer() {
        let cache = KeystoreCache::new(KeystoreCacheConfig::default());
        cache.insert(versioned("ks-1", 2));
        cache.insert(versioned("ks-1", 1));
        assert_eq!(cache.get("ks-1").unwrap().version, 2);

        cache.insert(versioned("ks-1", 3));
        assert_eq!(cache.get("ks-1").unwrap().version, 3);
    }

    #[test]
    fn test_invalidate_floor_rejects_earlier_snapshot() {
        let cache = KeystoreCache::new(KeystoreCacheConfig::default());
        cache.insert(versioned("ks-1", 0));

        // A reader fetched version 0 before the write committed version 1
        cache.invalidate("ks-1", 1);
        cache.insert(versioned("ks-1", 0));
        assert!(cache.get("ks-1").is_none());

        cache.insert(versioned("ks-1", 1));
        assert_eq!(cache.get("ks-1").unwrap().version, 1);
    }

    #[test]
    fn test_floor_expires_with_ttl() {
        let cache = KeystoreCache::with_ttl(Duration::from_millis(10));
        cache.invalidate("ks-1", 5);
        std::thread::sleep(Duration::from_millis(20));

        cache.insert(versioned("ks-1", 0));
        assert_eq!(cache.get("ks-1").unwrap().version, 0);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = KeystoreCache::new(KeystoreCacheConfig {
            max_entries: 2,
            ..Default::default()
        });
        cache.insert(record("ks-0"));
        std::thread::sleep(Duration::from_millis(5));
        cache.insert(record("ks-1"));
        std::thread::sleep(Duration::from_millis(5));

        cache.get("ks-0");
        cache.insert(record("ks-2"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("ks-0").is_some());
        assert!(cache.get("ks-1").is_none());
    }

    #[test]
    fn test_cleanup_removes_expired() {
        let cache = KeystoreCache::with_ttl(Duration::from_millis(5));
        cache.insert(record("ks-1"));
        cache.insert(record("ks-2"));
        std::thread::sleep(Duration::from_millis(15));

        assert_eq!(cache.cleanup(), 2);
        assert!(cache.is_empty());
    }
}
