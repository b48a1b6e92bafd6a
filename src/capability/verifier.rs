//! Pure delegation-chain verification.
//!
//! Nothing here touches storage. The caller loads the chain (leaf first,
//! root last) and hands it over together with the trusted issuer identity.

use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;

use super::model::{Action, Capability, PROOF_PURPOSE, PROOF_TYPE};
use crate::crypto::verify_payload;
use crate::types::CapabilityError;

/// Longest chain accepted, root included.
pub const MAX_CHAIN_DEPTH: usize = 16;

/// Multicodec prefix for an Ed25519 public key in `did:key`.
const ED25519_MULTICODEC: [u8; 2] = [0xed, 0x01];

/// The key every capability in a trusted chain must be signed with.
#[derive(Debug, Clone)]
pub struct IssuerIdentity {
    pub did: String,
    pub verifying_key: VerifyingKey,
}

impl IssuerIdentity {
    pub fn new(verifying_key: VerifyingKey) -> Self {
        Self {
            did: did_key(&verifying_key),
            verifying_key,
        }
    }
}

/// `did:key` identifier of an Ed25519 public key.
pub fn did_key(verifying_key: &VerifyingKey) -> String {
    let mut bytes = Vec::with_capacity(34);
    bytes.extend_from_slice(&ED25519_MULTICODEC);
    bytes.extend_from_slice(verifying_key.as_bytes());
    format!("did:key:z{}", bs58::encode(bytes).into_string())
}

/// Multibase (base58btc) encoding used for `proofValue`.
pub fn encode_proof_value(signature: &[u8]) -> String {
    format!("z{}", bs58::encode(signature).into_string())
}

fn decode_proof_value(value: &str) -> Option<Vec<u8>> {
    let body = value.strip_prefix('z')?;
    bs58::decode(body).into_vec().ok()
}

fn check_proof(link: &Capability, issuer: &IssuerIdentity) -> Result<(), CapabilityError> {
    let proof = link.proof.as_ref().ok_or(CapabilityError::ChainBroken)?;

    if proof.proof_type != PROOF_TYPE
        || proof.proof_purpose != PROOF_PURPOSE
        || proof.verification_method != issuer.did
    {
        return Err(CapabilityError::ChainBroken);
    }

    let signature = decode_proof_value(&proof.proof_value).ok_or(CapabilityError::ChainBroken)?;
    let payload = link
        .signing_payload()
        .map_err(|_| CapabilityError::ChainBroken)?;

    match verify_payload(&issuer.verifying_key, &payload, &signature) {
        Ok(true) => Ok(()),
        _ => Err(CapabilityError::ChainBroken),
    }
}

/// Verify `chain` for `invoker` performing `action` on `target` at `now`.
///
/// Links are checked from leaf to root: proof, expiry, then the link to its
/// parent (identity, delegator, target, action subset). The leaf is then
/// checked against the request. The first violation is returned.
pub fn verify_chain(
    chain: &[Capability],
    issuer: &IssuerIdentity,
    invoker: &str,
    action: Action,
    target: &str,
    now: DateTime<Utc>,
) -> Result<(), CapabilityError> {
    if chain.is_empty() || chain.len() > MAX_CHAIN_DEPTH {
        return Err(CapabilityError::ChainBroken);
    }

    for (i, link) in chain.iter().enumerate() {
        check_proof(link, issuer)?;

        if link.is_expired_at(now) {
            return Err(CapabilityError::Expired);
        }

        match (&link.parent_capability, chain.get(i + 1)) {
            (Some(parent_id), Some(parent)) => {
                if &parent.id != parent_id
                    || link.delegator != parent.invoker
                    || link.invocation_target != parent.invocation_target
                {
                    return Err(CapabilityError::ChainBroken);
                }
                if !link.allowed_action.is_subset(&parent.allowed_action) {
                    return Err(CapabilityError::ActionNotAllowed);
                }
            }
            (None, None) => {
                if link.delegator != issuer.did {
                    return Err(CapabilityError::ChainBroken);
                }
            }
            _ => return Err(CapabilityError::ChainBroken),
        }
    }

    let leaf = &chain[0];
    if leaf.invocation_target != target {
        return Err(CapabilityError::ActionNotAllowed);
    }
    if leaf.invoker != invoker {
        return Err(CapabilityError::InvokerMismatch);
    }
    if !leaf.allows(action) {
        return Err(CapabilityError::ActionNotAllowed);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::model::Proof;
    use crate::crypto::{generate_keypair, sign_payload};
    use chrono::Duration;
    use ed25519_dalek::SigningKey;
    use std::collections::BTreeSet;

    fn sign(mut cap: Capability, key: &SigningKey, did: &str) -> Capability {
        let payload = cap.signing_payload().unwrap();
        let signature = sign_payload(key, &payload);
        cap.proof = Some(Proof {
            proof_type: PROOF_TYPE.into(),
            created: Utc::now(),
            verification_method: did.into(),
            proof_purpose: PROOF_PURPOSE.into(),
            proof_value: encode_proof_value(&signature.to_bytes()),
        });
        cap
    }

    fn actions(list: &[Action]) -> BTreeSet<Action> {
        list.iter().copied().collect()
    }

    struct Fixture {
        key: SigningKey,
        issuer: IssuerIdentity,
    }

    impl Fixture {
        fn new() -> Self {
            let (key, vk) = generate_keypair();
            Self {
                key,
                issuer: IssuerIdentity::new(vk),
            }
        }

        fn root(&self, invoker: &str) -> Capability {
            let cap = Capability {
                id: Capability::new_id(),
                parent_capability: None,
                invoker: invoker.into(),
                delegator: self.issuer.did.clone(),
                invocation_target: "ks-1".into(),
                allowed_action: Action::all(),
                expires: Utc::now() + Duration::days(1),
                proof: None,
            };
            sign(cap, &self.key, &self.issuer.did)
        }

        fn child(&self, parent: &Capability, invoker: &str, allowed: &[Action]) -> Capability {
            let cap = Capability {
                id: Capability::new_id(),
                parent_capability: Some(parent.id.clone()),
                invoker: invoker.into(),
                delegator: parent.invoker.clone(),
                invocation_target: parent.invocation_target.clone(),
                allowed_action: actions(allowed),
                expires: parent.expires,
                proof: None,
            };
            sign(cap, &self.key, &self.issuer.did)
        }
    }

    #[test]
    fn test_did_key_format() {
        let (_, vk) = generate_keypair();
        let did = did_key(&vk);
        // 0xed01 prefix always encodes to z6Mk in base58btc
        assert!(did.starts_with("did:key:z6Mk"));
    }

    #[test]
    fn test_root_capability_verifies() {
        let fx = Fixture::new();
        let root = fx.root("did:example:alice");

        verify_chain(&[root], &fx.issuer, "did:example:alice", Action::Sign, "ks-1", Utc::now())
            .unwrap();
    }

    #[test]
    fn test_deep_chain_verifies() {
        let fx = Fixture::new();
        let root = fx.root("a");
        let c1 = fx.child(&root, "b", &[Action::Sign, Action::Verify, Action::Delegate]);
        let c2 = fx.child(&c1, "c", &[Action::Sign, Action::Delegate]);
        let c3 = fx.child(&c2, "d", &[Action::Sign]);

        let chain = vec![c3, c2, c1, root];
        verify_chain(&chain, &fx.issuer, "d", Action::Sign, "ks-1", Utc::now()).unwrap();
        assert_eq!(
            verify_chain(&chain, &fx.issuer, "d", Action::Verify, "ks-1", Utc::now()),
            Err(CapabilityError::ActionNotAllowed)
        );
    }

    #[test]
    fn test_invoker_mismatch() {
        let fx = Fixture::new();
        let root = fx.root("a");
        assert_eq!(
            verify_chain(&[root], &fx.issuer, "mallory", Action::Sign, "ks-1", Utc::now()),
            Err(CapabilityError::InvokerMismatch)
        );
    }

    #[test]
    fn test_expired_link() {
        let fx = Fixture::new();
        let root = fx.root("a");
        let later = Utc::now() + Duration::days(2);
        assert_eq!(
            verify_chain(&[root], &fx.issuer, "a", Action::Sign, "ks-1", later),
            Err(CapabilityError::Expired)
        );
    }

    #[test]
    fn test_tampered_field_breaks_chain() {
        let fx = Fixture::new();
        let mut root = fx.root("a");
        root.invoker = "mallory".into();
        assert_eq!(
            verify_chain(&[root], &fx.issuer, "mallory", Action::Sign, "ks-1", Utc::now()),
            Err(CapabilityError::ChainBroken)
        );
    }

    #[test]
    fn test_foreign_issuer_breaks_chain() {
        let fx = Fixture::new();
        let other = Fixture::new();
        let root = other.root("a");
        assert_eq!(
            verify_chain(&[root], &fx.issuer, "a", Action::Sign, "ks-1", Utc::now()),
            Err(CapabilityError::ChainBroken)
        );
    }

    #[test]
    fn test_missing_parent_breaks_chain() {
        let fx = Fixture::new();
        let root = fx.root("a");
        let child = fx.child(&root, "b", &[Action::Sign]);
        assert_eq!(
            verify_chain(&[child], &fx.issuer, "b", Action::Sign, "ks-1", Utc::now()),
            Err(CapabilityError::ChainBroken)
        );
    }

    #[test]
    fn test_escalated_child_rejected() {
        let fx = Fixture::new();
        let root = fx.root("a");
        let narrow = fx.child(&root, "b", &[Action::Verify, Action::Delegate]);
        let escalated = fx.child(&narrow, "c", &[Action::Sign]);

        assert_eq!(
            verify_chain(
                &[escalated, narrow, root],
                &fx.issuer,
                "c",
                Action::Sign,
                "ks-1",
                Utc::now()
            ),
            Err(CapabilityError::ActionNotAllowed)
        );
    }

    #[test]
    fn test_wrong_target_rejected() {
        let fx = Fixture::new();
        let root = fx.root("a");
        assert_eq!(
            verify_chain(&[root], &fx.issuer, "a", Action::Sign, "ks-2", Utc::now()),
            Err(CapabilityError::ActionNotAllowed)
        );
    }

    #[test]
    fn test_empty_and_overlong_chains() {
        let fx = Fixture::new();
        assert_eq!(
            verify_chain(&[], &fx.issuer, "a", Action::Sign, "ks-1", Utc::now()),
            Err(CapabilityError::ChainBroken)
        );

        let mut chain = vec![fx.root("n0")];
        for i in 1..=MAX_CHAIN_DEPTH {
            let next = fx.child(&chain[0], &format!("n{i}"), &Action::ALL);
            chain.insert(0, next);
        }
        assert_eq!(chain.len(), MAX_CHAIN_DEPTH + 1);
        let leaf = chain[0].invoker.clone();
        assert_eq!(
            verify_chain(&chain, &fx.issuer, &leaf, Action::Sign, "ks-1", Utc::now()),
            Err(CapabilityError::ChainBroken)
        );
    }
}
