//! Capability records.
//!
//! A capability is an immutable, signed record. Delegation chains are formed
//! by `parentCapability` holding the parent's ID, never an embedded copy.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{KmsError, Result};

/// Proof type used for every issued capability.
pub const PROOF_TYPE: &str = "Ed25519Signature2020";

/// Proof purpose for capability delegation.
pub const PROOF_PURPOSE: &str = "capabilityDelegation";

/// Actions a capability can grant on a keystore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    CreateKey,
    Export,
    Sign,
    Verify,
    Encrypt,
    Decrypt,
    Rotate,
    Delegate,
}

impl Action {
    pub const ALL: [Action; 8] = [
        Action::CreateKey,
        Action::Export,
        Action::Sign,
        Action::Verify,
        Action::Encrypt,
        Action::Decrypt,
        Action::Rotate,
        Action::Delegate,
    ];

    pub fn all() -> BTreeSet<Action> {
        Self::ALL.into_iter().collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateKey => "createKey",
            Self::Export => "export",
            Self::Sign => "sign",
            Self::Verify => "verify",
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
            Self::Rotate => "rotate",
            Self::Delegate => "delegate",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = KmsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| KmsError::Validation(format!("unknown action: {s}")))
    }
}

/// Signature binding every other field of a capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Proof {
    #[serde(rename = "type")]
    pub proof_type: String,
    pub created: DateTime<Utc>,
    /// `did:key` of the issuing key
    pub verification_method: String,
    pub proof_purpose: String,
    /// Multibase (base58btc) Ed25519 signature
    pub proof_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_capability: Option<String>,
    pub invoker: String,
    pub delegator: String,
    /// Keystore ID the capability is scoped to
    pub invocation_target: String,
    pub allowed_action: BTreeSet<Action>,
    pub expires: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<Proof>,
}

impl Capability {
    pub fn new_id() -> String {
        format!("urn:uuid:{}", uuid::Uuid::new_v4())
    }

    pub fn is_root(&self) -> bool {
        self.parent_capability.is_none()
    }

    pub fn allows(&self, action: Action) -> bool {
        self.allowed_action.contains(&action)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires
    }

    /// Bytes covered by the proof: the JSON encoding of every field except `proof`.
    pub fn signing_payload(&self) -> Result<Vec<u8>> {
        let unsigned = Capability {
            proof: None,
            ..self.clone()
        };
        Ok(serde_json::to_vec(&unsigned)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Capability {
        Capability {
            id: "urn:uuid:1".into(),
            parent_capability: None,
            invoker: "did:example:123456789".into(),
            delegator: "did:key:zIssuer".into(),
            invocation_target: "ks-1".into(),
            allowed_action: [Action::Sign, Action::Verify].into_iter().collect(),
            expires: Utc::now(),
            proof: None,
        }
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["invoker"], "did:example:123456789");
        assert_eq!(json["invocationTarget"], "ks-1");
        assert_eq!(json["allowedAction"], serde_json::json!(["sign", "verify"]));
        assert!(json.get("parentCapability").is_none());
        assert!(json.get("proof").is_none());
    }

    #[test]
    fn test_signing_payload_ignores_proof() {
        let unsigned = sample();
        let mut signed = unsigned.clone();
        signed.proof = Some(Proof {
            proof_type: PROOF_TYPE.into(),
            created: Utc::now(),
            verification_method: "did:key:z".into(),
            proof_purpose: PROOF_PURPOSE.into(),
            proof_value: "z123".into(),
        });

        assert_eq!(
            unsigned.signing_payload().unwrap(),
            signed.signing_payload().unwrap()
        );
    }

    #[test]
    fn test_action_parse() {
        assert_eq!("createKey".parse::<Action>().unwrap(), Action::CreateKey);
        assert!("launch".parse::<Action>().is_err());
        assert_eq!(Action::all().len(), 8);
    }
}
