//! Key operation dispatcher
//!
//! Every protected operation runs the same pipeline:
//!
//! 1. Load the keystore record
//! 2. Authorize the caller (controller, or a verified capability chain)
//! 3. Combine the client share with the server share into an [`EphemeralKey`]
//! 4. Unwrap the key and run the primitive
//! 5. Drop the ephemeral key and the unwrapped material
//!
//! Any failure returns before step 3 produces anything, or drops the guards
//! on the way out. Persistence is always the final step of a mutating
//! operation, and a vault document written for a commit that then fails is
//! deleted again.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::auth::Principal;
use crate::capability::{codec, Action, Capability, CapabilityIssuer};
use crate::crypto::{generate_random_bytes, keys, nonce_from_slice, open, seal, KeyType, NONCE_LEN};
use crate::keystore::{KeyRecord, KeystoreRecord, KeystoreRegistry, VaultBinding};
use crate::remote::{ServerShareSource, VaultClient, VaultDocument};
use crate::secret_lock::{EphemeralKey, SecretLock, SecretShare, SHARE_LEN};
use crate::types::{CapabilityError, KmsError, Result};

/// Who is asking, and with what authority.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub principal: Principal,
    /// Capability presented in the `Capability` header, if any
    pub capability: Option<Capability>,
}

impl Invocation {
    pub fn new(principal: Principal) -> Self {
        Self {
            principal,
            capability: None,
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }
}

#[derive(Debug, Clone)]
pub struct CreatedKeystore {
    pub keystore_id: String,
    pub root: Capability,
    /// Root capability in transport form (base64 gzip JSON)
    pub capability: String,
}

pub struct KmsService {
    registry: Arc<KeystoreRegistry>,
    issuer: Arc<CapabilityIssuer>,
    shares: Arc<dyn ServerShareSource>,
    vault: Arc<dyn VaultClient>,
}

impl KmsService {
    pub fn new(
        registry: Arc<KeystoreRegistry>,
        issuer: Arc<CapabilityIssuer>,
        shares: Arc<dyn ServerShareSource>,
        vault: Arc<dyn VaultClient>,
    ) -> Self {
        Self {
            registry,
            issuer,
            shares,
            vault,
        }
    }

    pub fn registry(&self) -> &KeystoreRegistry {
        &self.registry
    }

    pub fn issuer(&self) -> &CapabilityIssuer {
        &self.issuer
    }

    // =========================================================================
    // Pipeline stages
    // =========================================================================

    async fn authorize(&self, inv: &Invocation, record: &KeystoreRecord, action: Action) -> Result<()> {
        match &inv.capability {
            Some(capability) => {
                self.issuer
                    .verify(capability, &inv.principal.id, action, &record.id)
                    .await
            }
            None if inv.principal.id == record.controller => Ok(()),
            None => Err(CapabilityError::InvokerMismatch.into()),
        }
    }

    async fn unlock(
        &self,
        inv: &Invocation,
        record: &KeystoreRecord,
        client_share: Option<&[u8]>,
    ) -> Result<EphemeralKey> {
        let client_share = client_share
            .ok_or_else(|| KmsError::InvalidShare("missing Secret-Share header".into()))?;
        let client = SecretShare::client(client_share.to_vec());
        let server = self
            .shares
            .fetch(&record.share_owner, &inv.principal.token)
            .await?;

        SecretLock::unlock(&client, &server, &record.id).inspect_err(|_| {
            warn!(keystore_id = %record.id, principal = %inv.principal.id, "Share combination failed");
        })
    }

    fn wrap(
        wrapping: &EphemeralKey,
        keystore_id: &str,
        key_type: KeyType,
        previous: Option<String>,
    ) -> Result<KeyRecord> {
        let generated = keys::generate(key_type);
        let key_id = uuid::Uuid::new_v4().to_string();
        let nonce: [u8; NONCE_LEN] = generate_random_bytes();
        let aad = KeyRecord::wrap_aad(keystore_id, &key_id, key_type);
        let wrapped = seal(wrapping.as_bytes(), &nonce, &generated.private, &aad)?;

        Ok(KeyRecord {
            id: key_id,
            key_type,
            wrapped,
            nonce: nonce.to_vec(),
            public_key: generated.public,
            created_at: Utc::now(),
            previous,
            rotated_to: None,
        })
    }

    fn unwrap(wrapping: &EphemeralKey, keystore_id: &str, key: &KeyRecord) -> Result<Zeroizing<Vec<u8>>> {
        let aad = KeyRecord::wrap_aad(keystore_id, &key.id, key.key_type);
        open(wrapping.as_bytes(), &nonce_from_slice(&key.nonce)?, &key.wrapped, &aad)
            .map_err(|_| KmsError::InvalidShare("shares do not unlock this key".into()))
    }

    async fn mirror_to_vault(&self, record: &KeystoreRecord, key: &KeyRecord) -> Result<()> {
        if let Some(binding) = &record.vault {
            self.vault
                .write_document(binding, &VaultDocument::from_key(&record.id, key))
                .await?;
        }
        Ok(())
    }

    /// Commit `key`, then undo the vault write if the commit failed.
    async fn commit_mirrored(
        &self,
        record: KeystoreRecord,
        key: KeyRecord,
        rotating: Option<&str>,
    ) -> Result<KeystoreRecord> {
        let binding = record.vault.clone();
        let key_id = key.id.clone();
        self.mirror_to_vault(&record, &key).await?;

        let result = self.commit(record, key, rotating).await;
        if let (Err(e), Some(binding)) = (&result, &binding) {
            warn!(key_id = %key_id, "Commit failed, removing vault document: {}", e);
            if let Err(cleanup) = self.vault.delete_document(binding, &key_id).await {
                warn!(key_id = %key_id, "Vault document left behind: {}", cleanup);
            }
        }
        result
    }

    /// Write `key`, retrying once against a fresh read on `VersionConflict`.
    ///
    /// With `rotating`, the current head of that key's lineage is superseded
    /// on each attempt, so a lost race rotates the winner's key instead.
    async fn commit(
        &self,
        mut record: KeystoreRecord,
        mut key: KeyRecord,
        rotating: Option<&str>,
    ) -> Result<KeystoreRecord> {
        for attempt in 0..2 {
            let head = match rotating {
                Some(key_id) => Some(record.resolve_head(key_id)?.id.clone()),
                None => None,
            };
            key.previous = head.clone();

            match self
                .registry
                .update_key(&record.id, record.version, key.clone(), head.as_deref())
                .await
            {
                Err(KmsError::VersionConflict { expected, actual, .. }) if attempt == 0 => {
                    debug!(keystore_id = %record.id, expected, actual, "Version conflict, retrying");
                    record = self.registry.lookup_fresh(&record.id).await?;
                }
                Err(KmsError::VersionConflict { .. }) => break,
                other => return other,
            }
        }

        Err(KmsError::Conflict(format!(
            "keystore {} changed concurrently, retry the request",
            record.id
        )))
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Create a keystore controlled by `controller`. The server share of the
    /// creating principal unlocks it.
    pub async fn create_keystore(
        &self,
        inv: &Invocation,
        controller: &str,
        vault: Option<VaultBinding>,
    ) -> Result<CreatedKeystore> {
        if let Some(binding) = &vault {
            if binding.vault_url.trim().is_empty() {
                return Err(KmsError::Validation("vault_url is empty".into()));
            }
            codec::decode(&binding.capability)?;
        }

        let (record, root) = self
            .registry
            .create_keystore(controller, &inv.principal.id, vault)
            .await?;
        let capability = codec::encode(&root)?;

        Ok(CreatedKeystore {
            keystore_id: record.id,
            root,
            capability,
        })
    }

    pub async fn create_key(
        &self,
        inv: &Invocation,
        keystore_id: &str,
        key_type: &str,
        client_share: Option<&[u8]>,
    ) -> Result<String> {
        let record = self.registry.lookup_fresh(keystore_id).await?;
        self.authorize(inv, &record, Action::CreateKey).await?;
        let key_type: KeyType = key_type.parse()?;

        let key = {
            let wrapping = self.unlock(inv, &record, client_share).await?;
            Self::wrap(&wrapping, keystore_id, key_type, None)?
        };

        let key_id = key.id.clone();
        self.commit_mirrored(record, key, None).await?;

        info!(keystore_id, key_id = %key_id, key_type = %key_type, "Created key");
        Ok(key_id)
    }

    pub async fn sign(
        &self,
        inv: &Invocation,
        keystore_id: &str,
        key_id: &str,
        client_share: Option<&[u8]>,
        message: &[u8],
    ) -> Result<Vec<u8>> {
        let record = self.registry.lookup(keystore_id).await?;
        self.authorize(inv, &record, Action::Sign).await?;

        let key = record.key(key_id)?;
        if key.is_retired() {
            return Err(KmsError::Validation(format!("key {key_id} has been rotated")));
        }
        if !key.key_type.can_sign() {
            return Err(KmsError::Validation(format!(
                "key type {} does not support sign",
                key.key_type
            )));
        }

        let wrapping = self.unlock(inv, &record, client_share).await?;
        let private = Self::unwrap(&wrapping, keystore_id, key)?;
        keys::sign(key.key_type, &private, message)
    }

    /// Uses public material only. A wrong signature is `Ok(false)`.
    pub async fn verify(
        &self,
        inv: &Invocation,
        keystore_id: &str,
        key_id: &str,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool> {
        let record = self.registry.lookup(keystore_id).await?;
        self.authorize(inv, &record, Action::Verify).await?;

        let key = record.key(key_id)?;
        let public = key.public_key.as_deref().ok_or_else(|| {
            KmsError::Validation(format!("key type {} does not support verify", key.key_type))
        })?;
        keys::verify(key.key_type, public, message, signature)
    }

    /// `X25519ECDHKW` encrypts to the stored public key without a share;
    /// `CHACHA20POLY1305` needs the shares to unwrap its secret.
    pub async fn encrypt(
        &self,
        inv: &Invocation,
        keystore_id: &str,
        key_id: &str,
        client_share: Option<&[u8]>,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>> {
        let record = self.registry.lookup(keystore_id).await?;
        self.authorize(inv, &record, Action::Encrypt).await?;

        let key = record.key(key_id)?;
        if key.is_retired() {
            return Err(KmsError::Validation(format!("key {key_id} has been rotated")));
        }
        if !key.key_type.can_encrypt() {
            return Err(KmsError::Validation(format!(
                "key type {} does not support encrypt",
                key.key_type
            )));
        }

        if key.key_type.encrypt_needs_secret() {
            let wrapping = self.unlock(inv, &record, client_share).await?;
            let secret = Self::unwrap(&wrapping, keystore_id, key)?;
            keys::encrypt(key.key_type, &secret, plaintext, aad)
        } else {
            let public = key
                .public_key
                .as_deref()
                .ok_or_else(|| KmsError::Internal(format!("key {key_id} has no public key")))?;
            keys::encrypt(key.key_type, public, plaintext, aad)
        }
    }

    /// Allowed on rotated keys so older ciphertexts stay readable.
    pub async fn decrypt(
        &self,
        inv: &Invocation,
        keystore_id: &str,
        key_id: &str,
        client_share: Option<&[u8]>,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let record = self.registry.lookup(keystore_id).await?;
        self.authorize(inv, &record, Action::Decrypt).await?;

        let key = record.key(key_id)?;
        if !key.key_type.can_encrypt() {
            return Err(KmsError::Validation(format!(
                "key type {} does not support decrypt",
                key.key_type
            )));
        }

        let wrapping = self.unlock(inv, &record, client_share).await?;
        let secret = Self::unwrap(&wrapping, keystore_id, key)?;
        keys::decrypt(key.key_type, &secret, ciphertext, aad)
    }

    /// Public material is stored beside the wrapped key, so export needs
    /// authorization but no share.
    pub async fn export_public_key(
        &self,
        inv: &Invocation,
        keystore_id: &str,
        key_id: &str,
    ) -> Result<Vec<u8>> {
        let record = self.registry.lookup(keystore_id).await?;
        self.authorize(inv, &record, Action::Export).await?;

        let key = record.key(key_id)?;
        key.public_key.clone().ok_or_else(|| {
            KmsError::Validation(format!("key type {} has no public key", key.key_type))
        })
    }

    /// Replace the head of `key_id`'s lineage with fresh material of the
    /// same type. Returns the new key ID.
    pub async fn rotate(
        &self,
        inv: &Invocation,
        keystore_id: &str,
        key_id: &str,
        client_share: Option<&[u8]>,
    ) -> Result<String> {
        let record = self.registry.lookup_fresh(keystore_id).await?;
        self.authorize(inv, &record, Action::Rotate).await?;
        let key_type = record.resolve_head(key_id)?.key_type;

        let key = {
            let wrapping = self.unlock(inv, &record, client_share).await?;
            Self::wrap(&wrapping, keystore_id, key_type, None)?
        };

        let new_id = key.id.clone();
        self.commit_mirrored(record, key, Some(key_id)).await?;

        info!(keystore_id, key_id, new_key_id = %new_id, "Rotated key");
        Ok(new_id)
    }

    /// Delegate a subset of the caller's authority over a keystore.
    ///
    /// The controller delegates from the root capability; anyone else must
    /// present a capability that verifies for `delegate`.
    pub async fn delegate(
        &self,
        inv: &Invocation,
        keystore_id: &str,
        delegatee: &str,
        actions: BTreeSet<Action>,
        expires: Option<DateTime<Utc>>,
    ) -> Result<(Capability, String)> {
        let record = self.registry.lookup(keystore_id).await?;

        let parent = match &inv.capability {
            Some(capability) => {
                self.issuer
                    .verify(capability, &inv.principal.id, Action::Delegate, &record.id)
                    .await?;
                capability.clone()
            }
            None if inv.principal.id == record.controller => {
                let root = self
                    .issuer
                    .get(&record.root_capability_id)
                    .await?
                    .ok_or(CapabilityError::ChainBroken)?;
                self.issuer
                    .verify(&root, &inv.principal.id, Action::Delegate, &record.id)
                    .await?;
                root
            }
            None => return Err(CapabilityError::InvokerMismatch.into()),
        };

        let child = self.issuer.delegate(&parent, delegatee, actions, expires).await?;
        let encoded = codec::encode(&child)?;
        Ok((child, encoded))
    }

    /// Store the caller's server-held share (local share mode).
    pub async fn store_secret(&self, principal: &Principal, share: &[u8]) -> Result<()> {
        if share.len() != SHARE_LEN {
            return Err(KmsError::Validation(format!(
                "secret share must be {SHARE_LEN} bytes"
            )));
        }
        self.shares.store(&principal.id, share).await?;
        info!(principal = %principal.id, "Stored server share");
        Ok(())
    }
}
