//! Storage backends
//!
//! The registry, issuer and share source depend only on the traits below.
//! Two implementations exist: in-memory (`mem`) and MongoDB (`mongodb`),
//! selected at startup by the `database-type` and `user-keys-storage-type`
//! options.

pub mod memory;
pub mod mongo;
pub mod schemas;

use async_trait::async_trait;

use crate::capability::Capability;
use crate::keystore::KeystoreRecord;
use crate::secret_lock::SealedShare;
use crate::types::Result;

pub use memory::{MemoryCapabilityStore, MemoryKeystoreStore, MemoryShareStore};
pub use mongo::{
    MongoCapabilityStore, MongoClient, MongoCollection, MongoKeystoreStore, MongoShareStore,
};

/// Keystore metadata storage with compare-and-swap on `version`.
#[async_trait]
pub trait KeystoreStore: Send + Sync {
    /// Insert a new record. Fails with `Storage` if the ID is taken.
    async fn insert(&self, record: &KeystoreRecord) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<KeystoreRecord>>;

    /// Replace the stored record only if its version is still `expected_version`.
    ///
    /// Fails with `VersionConflict` carrying the stored version otherwise.
    async fn compare_and_swap(&self, record: &KeystoreRecord, expected_version: u64) -> Result<()>;
}

/// Issued capabilities, looked up by ID when walking chains.
#[async_trait]
pub trait CapabilityStore: Send + Sync {
    async fn put(&self, capability: &Capability) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Capability>>;
}

/// Sealed server-held shares, keyed by owning principal.
#[async_trait]
pub trait ShareStore: Send + Sync {
    async fn put(&self, owner: &str, share: &SealedShare) -> Result<()>;

    async fn get(&self, owner: &str) -> Result<Option<SealedShare>>;
}
