//! In-memory storage backend.
//!
//! `DashMap` shard locks make the version check and replacement in
//! `compare_and_swap` a single atomic step.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{CapabilityStore, KeystoreStore, ShareStore};
use crate::capability::Capability;
use crate::keystore::KeystoreRecord;
use crate::secret_lock::SealedShare;
use crate::types::{KmsError, Result};

#[derive(Default)]
pub struct MemoryKeystoreStore {
    records: DashMap<String, KeystoreRecord>,
}

impl MemoryKeystoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl KeystoreStore for MemoryKeystoreStore {
    async fn insert(&self, record: &KeystoreRecord) -> Result<()> {
        match self.records.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(KmsError::Storage(format!(
                "keystore {} already exists",
                record.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<KeystoreRecord>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn compare_and_swap(&self, record: &KeystoreRecord, expected_version: u64) -> Result<()> {
        let mut stored = self
            .records
            .get_mut(&record.id)
            .ok_or_else(|| KmsError::NotFound(record.id.clone()))?;

        if stored.version != expected_version {
            return Err(KmsError::VersionConflict {
                keystore_id: record.id.clone(),
                expected: expected_version,
                actual: stored.version,
            });
        }

        *stored = record.clone();
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCapabilityStore {
    capabilities: DashMap<String, Capability>,
}

impl MemoryCapabilityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CapabilityStore for MemoryCapabilityStore {
    async fn put(&self, capability: &Capability) -> Result<()> {
        self.capabilities
            .insert(capability.id.clone(), capability.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Capability>> {
        Ok(self.capabilities.get(id).map(|c| c.value().clone()))
    }
}

#[derive(Default)]
pub struct MemoryShareStore {
    shares: DashMap<String, SealedShare>,
}

impl MemoryShareStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShareStore for MemoryShareStore {
    async fn put(&self, owner: &str, share: &SealedShare) -> Result<()> {
        self.shares.insert(owner.to_string(), share.clone());
        Ok(())
    }

    async fn get(&self, owner: &str) -> Result<Option<SealedShare>> {
        Ok(self.shares.get(owner).map(|s| s.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> KeystoreRecord {
        KeystoreRecord::new(id.into(), "did:example:1".into(), "owner".into(), "cap".into())
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryKeystoreStore::new();
        store.insert(&record("ks-1")).await.unwrap();

        let found = store.get("ks-1").await.unwrap().unwrap();
        assert_eq!(found.controller, "did:example:1");
        assert!(store.get("ks-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_fails() {
        let store = MemoryKeystoreStore::new();
        store.insert(&record("ks-1")).await.unwrap();
        assert!(matches!(
            store.insert(&record("ks-1")).await,
            Err(KmsError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemoryKeystoreStore::new();
        let original = record("ks-1");
        store.insert(&original).await.unwrap();

        let mut next = original.clone();
        next.version = 1;
        store.compare_and_swap(&next, 0).await.unwrap();

        // Stale writer still expects version 0
        let mut stale = original.clone();
        stale.version = 1;
        match store.compare_and_swap(&stale, 0).await {
            Err(KmsError::VersionConflict { expected, actual, .. }) => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_share_store() {
        let store = MemoryShareStore::new();
        let sealed = SealedShare {
            nonce: vec![1; 12],
            ciphertext: vec![2; 40],
        };
        store.put("alice", &sealed).await.unwrap();
        assert_eq!(store.get("alice").await.unwrap(), Some(sealed));
        assert_eq!(store.get("bob").await.unwrap(), None);
    }
}
