//! Key types and the operations each one supports.
//!
//! | Type              | sign/verify | encrypt          | decrypt        | export |
//! |-------------------|-------------|------------------|----------------|--------|
//! | `ED25519`         | yes         | no               | no             | yes    |
//! | `X25519ECDHKW`    | no          | public key only  | private key    | yes    |
//! | `CHACHA20POLY1305`| no          | secret key       | secret key     | no     |

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::primitives::{
    derive_key, generate_random_bytes, nonce_from_slice, open, seal, sign_payload, verify_payload,
    KEY_LEN, NONCE_LEN,
};
use crate::types::{KmsError, Result};

const X25519_KW_INFO: &[u8] = b"kms/x25519-ecdh-kw/v1";

/// Supported key algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    #[serde(rename = "ED25519")]
    Ed25519,
    #[serde(rename = "X25519ECDHKW")]
    X25519EcdhKw,
    #[serde(rename = "CHACHA20POLY1305")]
    ChaCha20Poly1305,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ed25519 => "ED25519",
            Self::X25519EcdhKw => "X25519ECDHKW",
            Self::ChaCha20Poly1305 => "CHACHA20POLY1305",
        }
    }

    pub fn can_sign(&self) -> bool {
        matches!(self, Self::Ed25519)
    }

    pub fn can_encrypt(&self) -> bool {
        !self.can_sign()
    }

    /// Encryption needs the unwrapped key (and therefore both shares).
    pub fn encrypt_needs_secret(&self) -> bool {
        matches!(self, Self::ChaCha20Poly1305)
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = KmsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ED25519" => Ok(Self::Ed25519),
            "X25519ECDHKW" => Ok(Self::X25519EcdhKw),
            "CHACHA20POLY1305" => Ok(Self::ChaCha20Poly1305),
            _ => Err(KmsError::UnsupportedKeyType(s.to_string())),
        }
    }
}

/// Freshly generated key material. The private part never leaves this struct unwrapped.
pub struct GeneratedKey {
    pub private: Zeroizing<Vec<u8>>,
    pub public: Option<Vec<u8>>,
}

/// Generate key material for `key_type`.
pub fn generate(key_type: KeyType) -> GeneratedKey {
    match key_type {
        KeyType::Ed25519 => {
            let seed = Zeroizing::new(generate_random_bytes::<32>());
            let signing_key = SigningKey::from_bytes(&seed);
            GeneratedKey {
                private: Zeroizing::new(seed.to_vec()),
                public: Some(signing_key.verifying_key().to_bytes().to_vec()),
            }
        }
        KeyType::X25519EcdhKw => {
            let bytes = Zeroizing::new(generate_random_bytes::<32>());
            let secret = StaticSecret::from(*bytes);
            GeneratedKey {
                private: Zeroizing::new(bytes.to_vec()),
                public: Some(PublicKey::from(&secret).as_bytes().to_vec()),
            }
        }
        KeyType::ChaCha20Poly1305 => GeneratedKey {
            private: Zeroizing::new(generate_random_bytes::<KEY_LEN>().to_vec()),
            public: None,
        },
    }
}

fn fixed_32(bytes: &[u8], what: &str) -> Result<Zeroizing<[u8; 32]>> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| KmsError::Crypto(format!("{what} must be 32 bytes")))?;
    Ok(Zeroizing::new(arr))
}

fn unsupported(key_type: KeyType, op: &str) -> KmsError {
    KmsError::Validation(format!("key type {key_type} does not support {op}"))
}

/// Sign with an unwrapped private key.
pub fn sign(key_type: KeyType, private: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    if !key_type.can_sign() {
        return Err(unsupported(key_type, "sign"));
    }
    let seed = fixed_32(private, "signing key")?;
    let signing_key = SigningKey::from_bytes(&seed);
    Ok(sign_payload(&signing_key, message).to_bytes().to_vec())
}

/// Verify against stored public material.
pub fn verify(key_type: KeyType, public: &[u8], message: &[u8], signature: &[u8]) -> Result<bool> {
    if !key_type.can_sign() {
        return Err(unsupported(key_type, "verify"));
    }
    let bytes: [u8; 32] = public
        .try_into()
        .map_err(|_| KmsError::Crypto("public key must be 32 bytes".into()))?;
    let verifying_key = VerifyingKey::from_bytes(&bytes)
        .map_err(|e| KmsError::Crypto(format!("invalid public key: {e}")))?;
    verify_payload(&verifying_key, message, signature)
}

/// Encrypt. For `X25519ECDHKW` `key` is the recipient public key; for
/// `CHACHA20POLY1305` it is the unwrapped secret key.
pub fn encrypt(key_type: KeyType, key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    match key_type {
        KeyType::X25519EcdhKw => {
            let recipient = PublicKey::from(*fixed_32(key, "public key")?);
            let ephemeral = StaticSecret::from(generate_random_bytes::<32>());
            let ephemeral_public = PublicKey::from(&ephemeral);
            let shared = Zeroizing::new(ephemeral.diffie_hellman(&recipient).to_bytes());

            let mut salt = Vec::with_capacity(64);
            salt.extend_from_slice(ephemeral_public.as_bytes());
            salt.extend_from_slice(recipient.as_bytes());
            let kek = derive_key(&shared[..], &salt, X25519_KW_INFO)?;

            let nonce: [u8; NONCE_LEN] = generate_random_bytes();
            let ciphertext = seal(&kek, &nonce, plaintext, aad)?;

            let mut out = Vec::with_capacity(32 + NONCE_LEN + ciphertext.len());
            out.extend_from_slice(ephemeral_public.as_bytes());
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&ciphertext);
            Ok(out)
        }
        KeyType::ChaCha20Poly1305 => {
            let secret = fixed_32(key, "secret key")?;
            let nonce: [u8; NONCE_LEN] = generate_random_bytes();
            let ciphertext = seal(&secret, &nonce, plaintext, aad)?;

            let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&ciphertext);
            Ok(out)
        }
        KeyType::Ed25519 => Err(unsupported(key_type, "encrypt")),
    }
}

/// Decrypt with the unwrapped private or secret key.
pub fn decrypt(
    key_type: KeyType,
    private: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    match key_type {
        KeyType::X25519EcdhKw => {
            if ciphertext.len() < 32 + NONCE_LEN {
                return Err(KmsError::Validation("ciphertext too short".into()));
            }
            let (epk, rest) = ciphertext.split_at(32);
            let (nonce, body) = rest.split_at(NONCE_LEN);

            let secret = StaticSecret::from(*fixed_32(private, "private key")?);
            let recipient = PublicKey::from(&secret);
            let ephemeral_public = PublicKey::from(*fixed_32(epk, "ephemeral key")?);
            let shared = Zeroizing::new(secret.diffie_hellman(&ephemeral_public).to_bytes());

            let mut salt = Vec::with_capacity(64);
            salt.extend_from_slice(ephemeral_public.as_bytes());
            salt.extend_from_slice(recipient.as_bytes());
            let kek = derive_key(&shared[..], &salt, X25519_KW_INFO)?;

            open(&kek, &nonce_from_slice(nonce)?, body, aad)
        }
        KeyType::ChaCha20Poly1305 => {
            if ciphertext.len() < NONCE_LEN {
                return Err(KmsError::Validation("ciphertext too short".into()));
            }
            let (nonce, body) = ciphertext.split_at(NONCE_LEN);
            let secret = fixed_32(private, "secret key")?;
            open(&secret, &nonce_from_slice(nonce)?, body, aad)
        }
        KeyType::Ed25519 => Err(unsupported(key_type, "decrypt")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_type() {
        assert_eq!("ED25519".parse::<KeyType>().unwrap(), KeyType::Ed25519);
        assert_eq!("x25519ecdhkw".parse::<KeyType>().unwrap(), KeyType::X25519EcdhKw);
        assert!(matches!(
            "RSA4096".parse::<KeyType>(),
            Err(KmsError::UnsupportedKeyType(_))
        ));
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let key = generate(KeyType::Ed25519);
        let public = key.public.clone().unwrap();

        let mut signature = sign(KeyType::Ed25519, &key.private, b"message").unwrap();
        assert!(verify(KeyType::Ed25519, &public, b"message", &signature).unwrap());
        assert!(!verify(KeyType::Ed25519, &public, b"messagf", &signature).unwrap());

        signature[0] ^= 0x01;
        assert!(!verify(KeyType::Ed25519, &public, b"message", &signature).unwrap());
    }

    #[test]
    fn test_x25519_encrypt_with_public_decrypt_with_private() {
        let key = generate(KeyType::X25519EcdhKw);
        let public = key.public.clone().unwrap();

        let ciphertext = encrypt(KeyType::X25519EcdhKw, &public, b"payload", b"ctx").unwrap();
        let plaintext = decrypt(KeyType::X25519EcdhKw, &key.private, &ciphertext, b"ctx").unwrap();
        assert_eq!(plaintext.as_slice(), b"payload");

        assert!(decrypt(KeyType::X25519EcdhKw, &key.private, &ciphertext, b"other").is_err());
    }

    #[test]
    fn test_chacha_roundtrip() {
        let key = generate(KeyType::ChaCha20Poly1305);
        assert!(key.public.is_none());

        let ciphertext = encrypt(KeyType::ChaCha20Poly1305, &key.private, b"data", b"").unwrap();
        let plaintext = decrypt(KeyType::ChaCha20Poly1305, &key.private, &ciphertext, b"").unwrap();
        assert_eq!(plaintext.as_slice(), b"data");
    }

    #[test]
    fn test_unsupported_operations() {
        let key = generate(KeyType::ChaCha20Poly1305);
        assert!(sign(KeyType::ChaCha20Poly1305, &key.private, b"m").is_err());
        assert!(encrypt(KeyType::Ed25519, &[0u8; 32], b"m", b"").is_err());
    }
}
