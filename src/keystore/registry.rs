//! Keystore registry
//!
//! Creates keystores, serves lookups through the TTL cache and applies key
//! writes with optimistic concurrency. There is no in-process lock: the
//! storage backend's compare-and-swap decides which concurrent writer wins.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::cache::KeystoreCache;
use super::models::{KeyRecord, KeystoreRecord, VaultBinding};
use crate::capability::{Capability, CapabilityIssuer};
use crate::db::KeystoreStore;
use crate::types::{KmsError, Result};

pub struct KeystoreRegistry {
    store: Arc<dyn KeystoreStore>,
    issuer: Arc<CapabilityIssuer>,
    cache: KeystoreCache,
}

impl KeystoreRegistry {
    pub fn new(store: Arc<dyn KeystoreStore>, issuer: Arc<CapabilityIssuer>, cache: KeystoreCache) -> Self {
        Self {
            store,
            issuer,
            cache,
        }
    }

    /// Create an empty keystore owned by `controller` and its root capability.
    ///
    /// The capability is persisted before the record so a visible keystore
    /// always has a resolvable root. Each call allocates a fresh ID.
    pub async fn create_keystore(
        &self,
        controller: &str,
        share_owner: &str,
        vault: Option<VaultBinding>,
    ) -> Result<(KeystoreRecord, Capability)> {
        if controller.trim().is_empty() {
            return Err(KmsError::Validation("controller is empty".into()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let root = self.issuer.issue_root(controller, &id).await?;

        let mut record = KeystoreRecord::new(
            id,
            controller.to_string(),
            share_owner.to_string(),
            root.id.clone(),
        );
        record.vault = vault;

        self.store.insert(&record).await?;
        info!(keystore_id = %record.id, controller, "Created keystore");

        Ok((record, root))
    }

    /// Cached lookup.
    pub async fn lookup(&self, id: &str) -> Result<KeystoreRecord> {
        if let Some(record) = self.cache.get(id) {
            return Ok(record);
        }
        self.lookup_fresh(id).await
    }

    /// Lookup that bypasses the cache. Used before every write.
    pub async fn lookup_fresh(&self, id: &str) -> Result<KeystoreRecord> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| KmsError::NotFound(id.to_string()))?;
        self.cache.insert(record.clone());
        Ok(record)
    }

    /// Periodically drop expired cache entries and log cache statistics.
    pub fn spawn_cache_cleanup(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let removed = registry.cache.cleanup();
                let stats = registry.cache.stats();
                debug!(
                    removed,
                    cached = registry.cache.len(),
                    hits = stats.hits,
                    misses = stats.misses,
                    evictions = stats.evictions,
                    "Keystore cache cleanup"
                );
            }
        })
    }

    /// Add `key` to the keystore if it is still at `expected_version`.
    ///
    /// With `supersedes`, the named key is retired in the same write.
    /// Fails with `VersionConflict` when another writer got there first; the
    /// caller re-reads and decides whether to retry.
    pub async fn update_key(
        &self,
        id: &str,
        expected_version: u64,
        key: KeyRecord,
        supersedes: Option<&str>,
    ) -> Result<KeystoreRecord> {
        let current = self.lookup_fresh(id).await?;
        if current.version != expected_version {
            return Err(KmsError::VersionConflict {
                keystore_id: id.to_string(),
                expected: expected_version,
                actual: current.version,
            });
        }

        let next = current.with_key(key, supersedes)?;
        match self.store.compare_and_swap(&next, expected_version).await {
            Ok(()) => self.cache.invalidate(id, next.version),
            Err(e) => {
                let floor = match &e {
                    KmsError::VersionConflict { .. } => expected_version + 1,
                    _ => expected_version,
                };
                self.cache.invalidate(id, floor);
                return Err(e);
            }
        }

        debug!(keystore_id = id, version = next.version, "Keystore updated");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyType;
    use crate::db::{MemoryCapabilityStore, MemoryKeystoreStore};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    /// Store whose `get` can be held open after reading its snapshot.
    #[derive(Default)]
    struct PausingStore {
        inner: MemoryKeystoreStore,
        pause: AtomicBool,
        snapshot_taken: Notify,
        resume: Notify,
    }

    #[async_trait]
    impl KeystoreStore for PausingStore {
        async fn insert(&self, record: &KeystoreRecord) -> Result<()> {
            self.inner.insert(record).await
        }

        async fn get(&self, id: &str) -> Result<Option<KeystoreRecord>> {
            let snapshot = self.inner.get(id).await?;
            if self.pause.swap(false, Ordering::SeqCst) {
                self.snapshot_taken.notify_one();
                self.resume.notified().await;
            }
            Ok(snapshot)
        }

        async fn compare_and_swap(&self, record: &KeystoreRecord, expected_version: u64) -> Result<()> {
            self.inner.compare_and_swap(record, expected_version).await
        }
    }

    fn registry() -> KeystoreRegistry {
        let issuer = CapabilityIssuer::ephemeral(Arc::new(MemoryCapabilityStore::new()), Duration::days(1));
        KeystoreRegistry::new(
            Arc::new(MemoryKeystoreStore::new()),
            Arc::new(issuer),
            KeystoreCache::with_ttl(std::time::Duration::from_secs(60)),
        )
    }

    fn key(id: &str) -> KeyRecord {
        KeyRecord {
            id: id.into(),
            key_type: KeyType::Ed25519,
            wrapped: vec![1; 48],
            nonce: vec![0; 12],
            public_key: Some(vec![2; 32]),
            created_at: Utc::now(),
            previous: None,
            rotated_to: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let registry = registry();
        let (record, root) = registry
            .create_keystore("did:example:123456789", "owner", None)
            .await
            .unwrap();

        assert_eq!(root.invoker, "did:example:123456789");
        assert_eq!(root.invocation_target, record.id);
        assert_eq!(record.root_capability_id, root.id);
        assert_eq!(record.version, 0);

        let found = registry.lookup(&record.id).await.unwrap();
        assert_eq!(found.controller, "did:example:123456789");
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let registry = registry();
        assert!(matches!(
            registry.lookup("nope").await,
            Err(KmsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_same_controller_gets_distinct_keystores() {
        let registry = Arc::new(registry());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.create_keystore("alice", "alice", None).await.unwrap().0.id
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }
        assert_eq!(ids.len(), 16);
    }

    #[tokio::test]
    async fn test_update_key_version_conflict() {
        let registry = registry();
        let (record, _) = registry.create_keystore("alice", "alice", None).await.unwrap();

        let updated = registry.update_key(&record.id, 0, key("k1"), None).await.unwrap();
        assert_eq!(updated.version, 1);

        let stale = registry.update_key(&record.id, 0, key("k2"), None).await;
        match stale {
            Err(KmsError::VersionConflict { expected, actual, .. }) => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        // Lookup reflects the write, not a stale cached copy
        let found = registry.lookup(&record.id).await.unwrap();
        assert_eq!(found.version, 1);
        assert!(found.keys.contains_key("k1"));
        assert!(!found.keys.contains_key("k2"));
    }

    #[tokio::test]
    async fn test_slow_reader_does_not_restore_stale_record() {
        let store = Arc::new(PausingStore::default());
        let issuer = CapabilityIssuer::ephemeral(Arc::new(MemoryCapabilityStore::new()), Duration::days(1));
        let registry = Arc::new(KeystoreRegistry::new(
            store.clone(),
            Arc::new(issuer),
            KeystoreCache::with_ttl(std::time::Duration::from_secs(600)),
        ));
        let (record, _) = registry.create_keystore("alice", "alice", None).await.unwrap();

        // Reader snapshots version 0, then stalls
        store.pause.store(true, Ordering::SeqCst);
        let reader = {
            let registry = registry.clone();
            let id = record.id.clone();
            tokio::spawn(async move { registry.lookup_fresh(&id).await.unwrap() })
        };
        store.snapshot_taken.notified().await;

        registry.update_key(&record.id, 0, key("k1"), None).await.unwrap();

        store.resume.notify_one();
        let stale = reader.await.unwrap();
        assert_eq!(stale.version, 0);

        let found = registry.lookup(&record.id).await.unwrap();
        assert_eq!(found.version, 1);
        assert!(found.keys.contains_key("k1"));
    }

    #[tokio::test]
    async fn test_cache_cleanup_task_drops_expired() {
        let issuer = CapabilityIssuer::ephemeral(Arc::new(MemoryCapabilityStore::new()), Duration::days(1));
        let registry = Arc::new(KeystoreRegistry::new(
            Arc::new(MemoryKeystoreStore::new()),
            Arc::new(issuer),
            KeystoreCache::with_ttl(std::time::Duration::from_millis(10)),
        ));
        registry.create_keystore("alice", "alice", None).await.unwrap();
        let (record, _) = registry.create_keystore("bob", "bob", None).await.unwrap();
        registry.lookup(&record.id).await.unwrap();
        assert_eq!(registry.cache.len(), 1);

        let task = registry.spawn_cache_cleanup(std::time::Duration::from_millis(5));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        task.abort();

        assert!(registry.cache.is_empty());
        assert!(registry.cache.stats().evictions >= 1);
    }

    #[tokio::test]
    async fn test_blank_controller_rejected() {
        let registry = registry();
        assert!(matches!(
            registry.create_keystore("  ", "x", None).await,
            Err(KmsError::Validation(_))
        ));
    }
}
