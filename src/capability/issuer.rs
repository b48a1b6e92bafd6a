//! Capability issuer
//!
//! Holds the service's capability-signing key, mints root and delegated
//! capabilities, persists every issued capability and loads chains back
//! by parent ID for verification.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::SigningKey;
use tracing::{debug, info, warn};

use super::model::{Action, Capability, Proof, PROOF_PURPOSE, PROOF_TYPE};
use super::verifier::{encode_proof_value, verify_chain, IssuerIdentity, MAX_CHAIN_DEPTH};
use crate::crypto::{generate_keypair, sign_payload};
use crate::db::CapabilityStore;
use crate::secret_lock::MasterKey;
use crate::types::{CapabilityError, KmsError, Result};

/// HKDF info for deriving the signing seed from the master key.
const ISSUER_KEY_INFO: &[u8] = b"kms/capability-issuer/v1";

pub struct CapabilityIssuer {
    signing_key: SigningKey,
    identity: IssuerIdentity,
    store: Arc<dyn CapabilityStore>,
    default_expiry: Duration,
}

impl CapabilityIssuer {
    pub fn new(signing_key: SigningKey, store: Arc<dyn CapabilityStore>, default_expiry: Duration) -> Self {
        let identity = IssuerIdentity::new(signing_key.verifying_key());
        Self {
            signing_key,
            identity,
            store,
            default_expiry,
        }
    }

    /// Issuer whose key is derived from the master key, stable across restarts.
    pub fn from_master(
        master: &MasterKey,
        store: Arc<dyn CapabilityStore>,
        default_expiry: Duration,
    ) -> Result<Self> {
        let seed = master.derive(ISSUER_KEY_INFO)?;
        let issuer = Self::new(SigningKey::from_bytes(&seed), store, default_expiry);
        info!(did = %issuer.did(), "Capability issuer key derived from master key");
        Ok(issuer)
    }

    /// Issuer with a random key. Capabilities do not survive a restart.
    pub fn ephemeral(store: Arc<dyn CapabilityStore>, default_expiry: Duration) -> Self {
        let (signing_key, _) = generate_keypair();
        let issuer = Self::new(signing_key, store, default_expiry);
        warn!(did = %issuer.did(), "Capability issuer using a random key");
        issuer
    }

    pub fn did(&self) -> &str {
        &self.identity.did
    }

    pub fn identity(&self) -> &IssuerIdentity {
        &self.identity
    }

    fn sign(&self, mut capability: Capability) -> Result<Capability> {
        let payload = capability.signing_payload()?;
        let signature = sign_payload(&self.signing_key, &payload);
        capability.proof = Some(Proof {
            proof_type: PROOF_TYPE.to_string(),
            created: Utc::now(),
            verification_method: self.identity.did.clone(),
            proof_purpose: PROOF_PURPOSE.to_string(),
            proof_value: encode_proof_value(&signature.to_bytes()),
        });
        Ok(capability)
    }

    /// Root capability granting `controller` every action on `keystore_id`.
    pub async fn issue_root(&self, controller: &str, keystore_id: &str) -> Result<Capability> {
        let capability = self.sign(Capability {
            id: Capability::new_id(),
            parent_capability: None,
            invoker: controller.to_string(),
            delegator: self.identity.did.clone(),
            invocation_target: keystore_id.to_string(),
            allowed_action: Action::all(),
            expires: Utc::now() + self.default_expiry,
            proof: None,
        })?;

        self.store.put(&capability).await?;
        debug!(keystore_id, capability_id = %capability.id, "Issued root capability");
        Ok(capability)
    }

    /// Derive a narrower capability for `delegatee` from `parent`.
    ///
    /// `expiry` defaults to the parent's. Widening actions or lifetime is a
    /// `ScopeViolation`.
    pub async fn delegate(
        &self,
        parent: &Capability,
        delegatee: &str,
        actions: BTreeSet<Action>,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<Capability> {
        if delegatee.trim().is_empty() {
            return Err(KmsError::Validation("delegatee is empty".into()));
        }
        if actions.is_empty() {
            return Err(KmsError::Validation("no actions to delegate".into()));
        }
        if !actions.is_subset(&parent.allowed_action) {
            return Err(CapabilityError::ScopeViolation.into());
        }

        let expires = expiry.unwrap_or(parent.expires);
        if expires > parent.expires {
            return Err(CapabilityError::ScopeViolation.into());
        }
        if expires <= Utc::now() {
            return Err(KmsError::Validation("expiry is in the past".into()));
        }

        let capability = self.sign(Capability {
            id: Capability::new_id(),
            parent_capability: Some(parent.id.clone()),
            invoker: delegatee.to_string(),
            delegator: parent.invoker.clone(),
            invocation_target: parent.invocation_target.clone(),
            allowed_action: actions,
            expires,
            proof: None,
        })?;

        self.store.put(&capability).await?;
        debug!(
            parent = %parent.id,
            capability_id = %capability.id,
            delegatee,
            "Delegated capability"
        );
        Ok(capability)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Capability>> {
        self.store.get(id).await
    }

    /// Load `leaf` and its ancestors, leaf first.
    ///
    /// Walks parent IDs iteratively. A missing parent, a revisited ID or a
    /// chain longer than the maximum depth is `ChainBroken`.
    pub async fn load_chain(&self, leaf: &Capability) -> Result<Vec<Capability>> {
        let mut chain = vec![leaf.clone()];
        let mut seen = HashSet::from([leaf.id.clone()]);

        while let Some(parent_id) = chain.last().and_then(|c| c.parent_capability.clone()) {
            if chain.len() >= MAX_CHAIN_DEPTH || !seen.insert(parent_id.clone()) {
                return Err(CapabilityError::ChainBroken.into());
            }
            let parent = self
                .store
                .get(&parent_id)
                .await?
                .ok_or(CapabilityError::ChainBroken)?;
            chain.push(parent);
        }

        Ok(chain)
    }

    /// Verify a presented capability for `invoker` performing `action` on `target`.
    pub async fn verify(
        &self,
        capability: &Capability,
        invoker: &str,
        action: Action,
        target: &str,
    ) -> Result<()> {
        let chain = self.load_chain(capability).await?;
        verify_chain(&chain, &self.identity, invoker, action, target, Utc::now())?;
        Ok(())
    }
}
