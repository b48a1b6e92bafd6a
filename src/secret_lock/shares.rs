//! 2-of-2 secret shares.
//!
//! A keystore secret is dealt into exactly two Shamir shares over GF(256).
//! Before dealing, an 8-byte check tag derived from the secret is appended,
//! so a reconstruction from shares of different splits is detected instead of
//! silently yielding a wrong secret.
//!
//! Share encoding is the `sharks` serialization: one x-coordinate byte
//! followed by the y-values.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sharks::{Share, Sharks};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::generate_random_bytes;
use crate::types::{KmsError, Result};

// =============================================================================
// Constants
// =============================================================================

/// Length of a keystore secret (32 bytes)
pub const SECRET_LEN: usize = 32;

/// Length of the integrity tag appended before dealing (8 bytes)
pub const CHECK_TAG_LEN: usize = 8;

/// Serialized share length: x-coordinate + secret + tag
pub const SHARE_LEN: usize = 1 + SECRET_LEN + CHECK_TAG_LEN;

const SHARE_THRESHOLD: u8 = 2;

const CHECK_TAG_DOMAIN: &[u8] = b"kms/share-check/v1";

// =============================================================================
// Share Types
// =============================================================================

/// Who holds a share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareHolder {
    /// Carried by the caller in the `Secret-Share` header
    Client,
    /// Held by the auth service or the local share store
    Server,
}

/// One half of a 2-of-2 split. Bytes are zeroized on drop.
#[derive(Clone)]
pub struct SecretShare {
    holder: ShareHolder,
    bytes: Zeroizing<Vec<u8>>,
}

impl SecretShare {
    pub fn new(holder: ShareHolder, bytes: Vec<u8>) -> Self {
        Self {
            holder,
            bytes: Zeroizing::new(bytes),
        }
    }

    pub fn client(bytes: Vec<u8>) -> Self {
        Self::new(ShareHolder::Client, bytes)
    }

    pub fn server(bytes: Vec<u8>) -> Self {
        Self::new(ShareHolder::Server, bytes)
    }

    pub fn holder(&self) -> ShareHolder {
        self.holder
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for SecretShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretShare")
            .field("holder", &self.holder)
            .field("len", &self.bytes.len())
            .finish()
    }
}

// =============================================================================
// Split / Combine
// =============================================================================

/// Generate a fresh random keystore secret.
pub fn generate_secret() -> Zeroizing<[u8; SECRET_LEN]> {
    Zeroizing::new(generate_random_bytes::<SECRET_LEN>())
}

fn check_tag(secret: &[u8]) -> [u8; CHECK_TAG_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(CHECK_TAG_DOMAIN);
    hasher.update(secret);
    let digest = hasher.finalize();

    let mut tag = [0u8; CHECK_TAG_LEN];
    tag.copy_from_slice(&digest[..CHECK_TAG_LEN]);
    tag
}

/// Split a secret into a (client, server) share pair.
pub fn split_secret(secret: &[u8; SECRET_LEN]) -> (SecretShare, SecretShare) {
    let mut payload = Zeroizing::new(Vec::with_capacity(SECRET_LEN + CHECK_TAG_LEN));
    payload.extend_from_slice(secret);
    payload.extend_from_slice(&check_tag(secret));

    let mut dealt = Sharks(SHARE_THRESHOLD)
        .dealer(&payload)
        .take(2)
        .map(|share| Vec::from(&share));

    // The dealer is an unbounded iterator, so both shares are always present.
    let client = dealt.next().unwrap_or_default();
    let server = dealt.next().unwrap_or_default();

    (SecretShare::client(client), SecretShare::server(server))
}

/// Reconstruct the secret from two raw shares, in either order.
///
/// Fails with `InvalidShare` for malformed input, shares with the same
/// x-coordinate, or shares belonging to different splits.
pub fn combine_shares(a: &[u8], b: &[u8]) -> Result<Zeroizing<[u8; SECRET_LEN]>> {
    if a.len() != SHARE_LEN || b.len() != SHARE_LEN {
        return Err(KmsError::InvalidShare("malformed share".into()));
    }

    let shares = [parse_share(a)?, parse_share(b)?];
    let recovered = Zeroizing::new(
        Sharks(SHARE_THRESHOLD)
            .recover(shares.iter())
            .map_err(|e| KmsError::InvalidShare(e.to_string()))?,
    );

    if recovered.len() != SECRET_LEN + CHECK_TAG_LEN {
        return Err(KmsError::InvalidShare("reconstruction length mismatch".into()));
    }

    let (secret_part, tag_part) = recovered.split_at(SECRET_LEN);
    let mut expected = check_tag(secret_part);
    let matches: bool = expected[..].ct_eq(tag_part).into();
    expected.zeroize();

    if !matches {
        return Err(KmsError::InvalidShare("shares do not belong to the same secret".into()));
    }

    let mut secret = Zeroizing::new([0u8; SECRET_LEN]);
    secret.copy_from_slice(secret_part);
    Ok(secret)
}

fn parse_share(bytes: &[u8]) -> Result<Share> {
    Share::try_from(bytes).map_err(|e| KmsError::InvalidShare(e.to_string()))
}

/// Reconstruct from tagged shares: exactly one client-held and one server-held share.
pub fn combine(client: &SecretShare, server: &SecretShare) -> Result<Zeroizing<[u8; SECRET_LEN]>> {
    if client.holder() != ShareHolder::Client || server.holder() != ShareHolder::Server {
        return Err(KmsError::InvalidShare(
            "expected one client-held and one server-held share".into(),
        ));
    }
    combine_shares(client.as_bytes(), server.as_bytes())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_combine_roundtrip() {
        let secret = generate_secret();
        let (client, server) = split_secret(&secret);

        assert_eq!(client.as_bytes().len(), SHARE_LEN);
        assert_eq!(server.as_bytes().len(), SHARE_LEN);

        let recovered = combine(&client, &server).unwrap();
        assert_eq!(*recovered, *secret);
    }

    #[test]
    fn test_combine_is_order_independent() {
        let secret = generate_secret();
        let (client, server) = split_secret(&secret);

        let ab = combine_shares(client.as_bytes(), server.as_bytes()).unwrap();
        let ba = combine_shares(server.as_bytes(), client.as_bytes()).unwrap();
        assert_eq!(*ab, *secret);
        assert_eq!(*ba, *secret);
    }

    #[test]
    fn test_shares_from_different_splits_fail() {
        let (client_a, _) = split_secret(&generate_secret());
        let (_, server_b) = split_secret(&generate_secret());

        let result = combine(&client_a, &server_b);
        assert!(matches!(result, Err(KmsError::InvalidShare(_))));
    }

    #[test]
    fn test_same_share_twice_fails() {
        let (client, _) = split_secret(&generate_secret());
        let result = combine_shares(client.as_bytes(), client.as_bytes());
        assert!(matches!(result, Err(KmsError::InvalidShare(_))));
    }

    #[test]
    fn test_malformed_share_fails() {
        let (client, _) = split_secret(&generate_secret());
        assert!(matches!(
            combine_shares(client.as_bytes(), &[1u8; 4]),
            Err(KmsError::InvalidShare(_))
        ));
        assert!(matches!(
            combine_shares(&[], client.as_bytes()),
            Err(KmsError::InvalidShare(_))
        ));
    }

    #[test]
    fn test_tampered_share_fails() {
        let secret = generate_secret();
        let (client, server) = split_secret(&secret);

        let mut tampered = client.as_bytes().to_vec();
        tampered[5] ^= 0x01;

        let result = combine(&SecretShare::client(tampered), &server);
        assert!(matches!(result, Err(KmsError::InvalidShare(_))));
    }

    #[test]
    fn test_holder_tags_are_enforced() {
        let (client, server) = split_secret(&generate_secret());

        let swapped = combine(&server, &client);
        assert!(matches!(swapped, Err(KmsError::InvalidShare(_))));

        let both_client = SecretShare::client(server.as_bytes().to_vec());
        assert!(combine(&client, &both_client).is_err());
    }

    #[test]
    fn test_debug_hides_bytes() {
        let (client, _) = split_secret(&generate_secret());
        let printed = format!("{:?}", client);
        assert!(printed.contains("len"));
        assert!(!printed.contains(&format!("{:?}", client.as_bytes())));
    }
}
