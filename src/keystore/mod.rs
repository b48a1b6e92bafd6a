//! Keystores
//!
//! A keystore is a tenant-scoped container of wrapped keys owned by one
//! controller. Records are versioned; every key write bumps the version
//! through a storage-level compare-and-swap.

pub mod cache;
pub mod models;
pub mod registry;

pub use cache::{KeystoreCache, KeystoreCacheConfig};
pub use models::{KeyRecord, KeystoreRecord, VaultBinding};
pub use registry::KeystoreRegistry;
