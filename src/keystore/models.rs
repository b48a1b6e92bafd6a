//! Keystore and key records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::KeyType;
use crate::types::{base64_bytes, option_base64_bytes, KmsError, Result};

/// Upper bound on rotation lineage walks.
const MAX_ROTATION_HOPS: usize = 1024;

/// Binding to an external Encrypted Data Vault.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultBinding {
    pub vault_url: String,
    /// Vault capability delegated to this service, base64 gzip as received.
    pub capability: String,
}

/// A key owned by a keystore. Only wrapped (encrypted) private material is stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyRecord {
    pub id: String,
    pub key_type: KeyType,
    /// Private key material wrapped under the keystore's ephemeral wrapping key
    #[serde(with = "base64_bytes")]
    pub wrapped: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    /// Public half, stored in the clear so verify/export skip share combination
    #[serde(default, with = "option_base64_bytes", skip_serializing_if = "Option::is_none")]
    pub public_key: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    /// Key this one replaced on rotation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    /// Key that replaced this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_to: Option<String>,
}

impl KeyRecord {
    pub fn is_retired(&self) -> bool {
        self.rotated_to.is_some()
    }

    /// Additional data bound into the wrapping ciphertext.
    pub fn wrap_aad(keystore_id: &str, key_id: &str, key_type: KeyType) -> Vec<u8> {
        format!("{keystore_id}/{key_id}/{key_type}").into_bytes()
    }
}

/// Tenant-scoped container of keys.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct KeystoreRecord {
    pub id: String,
    pub controller: String,
    pub created_at: DateTime<Utc>,
    /// Bumped on every key write; guarded by compare-and-swap in storage
    pub version: u64,
    /// Principal whose server-held share unlocks this keystore
    pub share_owner: String,
    pub root_capability_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault: Option<VaultBinding>,
    #[serde(default)]
    pub keys: BTreeMap<String, KeyRecord>,
}

impl KeystoreRecord {
    pub fn new(id: String, controller: String, share_owner: String, root_capability_id: String) -> Self {
        Self {
            id,
            controller,
            created_at: Utc::now(),
            version: 0,
            share_owner,
            root_capability_id,
            vault: None,
            keys: BTreeMap::new(),
        }
    }

    pub fn key(&self, key_id: &str) -> Result<&KeyRecord> {
        self.keys
            .get(key_id)
            .ok_or_else(|| KmsError::KeyNotFound(key_id.to_string()))
    }

    /// Follow `rotated_to` links to the current key of a lineage.
    pub fn resolve_head(&self, key_id: &str) -> Result<&KeyRecord> {
        let mut current = self.key(key_id)?;
        for _ in 0..MAX_ROTATION_HOPS {
            match &current.rotated_to {
                Some(next) => current = self.key(next)?,
                None => return Ok(current),
            }
        }
        Err(KmsError::Internal(format!(
            "rotation lineage of {key_id} does not terminate"
        )))
    }

    /// Copy of this record with `key` added at the next version.
    ///
    /// When `supersedes` is set, that key is marked as rotated to the new one.
    pub fn with_key(&self, key: KeyRecord, supersedes: Option<&str>) -> Result<Self> {
        let mut next = self.clone();
        if let Some(old_id) = supersedes {
            let old = next
                .keys
                .get_mut(old_id)
                .ok_or_else(|| KmsError::KeyNotFound(old_id.to_string()))?;
            if old.rotated_to.is_some() {
                return Err(KmsError::VersionConflict {
                    keystore_id: self.id.clone(),
                    expected: self.version,
                    actual: self.version,
                });
            }
            old.rotated_to = Some(key.id.clone());
        }
        next.keys.insert(key.id.clone(), key);
        next.version = self.version + 1;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> KeyRecord {
        KeyRecord {
            id: id.into(),
            key_type: KeyType::Ed25519,
            wrapped: vec![1, 2, 3],
            nonce: vec![0; 12],
            public_key: Some(vec![9; 32]),
            created_at: Utc::now(),
            previous: None,
            rotated_to: None,
        }
    }

    #[test]
    fn test_with_key_bumps_version() {
        let ks = KeystoreRecord::new("ks".into(), "did:example:1".into(), "owner".into(), "cap".into());
        let next = ks.with_key(key("k1"), None).unwrap();

        assert_eq!(ks.version, 0);
        assert_eq!(next.version, 1);
        assert!(next.key("k1").is_ok());
        assert!(matches!(ks.key("k1"), Err(KmsError::KeyNotFound(_))));
    }

    #[test]
    fn test_rotation_links_and_head() {
        let ks = KeystoreRecord::new("ks".into(), "c".into(), "o".into(), "cap".into());
        let ks = ks.with_key(key("k1"), None).unwrap();

        let mut k2 = key("k2");
        k2.previous = Some("k1".into());
        let ks = ks.with_key(k2, Some("k1")).unwrap();

        assert!(ks.key("k1").unwrap().is_retired());
        assert_eq!(ks.resolve_head("k1").unwrap().id, "k2");
        assert_eq!(ks.resolve_head("k2").unwrap().id, "k2");
        assert_eq!(ks.version, 2);
    }

    #[test]
    fn test_superseding_retired_key_conflicts() {
        let ks = KeystoreRecord::new("ks".into(), "c".into(), "o".into(), "cap".into());
        let ks = ks.with_key(key("k1"), None).unwrap();
        let ks = ks.with_key(key("k2"), Some("k1")).unwrap();

        assert!(matches!(
            ks.with_key(key("k3"), Some("k1")),
            Err(KmsError::VersionConflict { .. })
        ));
    }

    #[test]
    fn test_record_serializes_bytes_as_base64() {
        let json = serde_json::to_value(key("k1")).unwrap();
        assert_eq!(json["wrapped"], "AQID");
        assert_eq!(json["key_type"], "ED25519");
    }
}
