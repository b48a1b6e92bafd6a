//! Cryptographic primitives shared by key wrapping, sealing and capabilities.
//!
//! # Algorithms
//!
//! - **Wrapping / sealing**: ChaCha20-Poly1305 (authenticated encryption)
//! - **Key derivation**: HKDF-SHA256
//! - **Signing**: Ed25519

use chacha20poly1305::{
    aead::{Aead, Payload},
    ChaCha20Poly1305, Key, KeyInit, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::types::{KmsError, Result};

// =============================================================================
// Constants
// =============================================================================

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// Symmetric key length (32 bytes)
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 auth tag length (16 bytes)
pub const AUTH_TAG_LEN: usize = 16;

/// Ed25519 signature length (64 bytes)
pub const SIGNATURE_LEN: usize = 64;

// =============================================================================
// Randomness
// =============================================================================

/// Generate cryptographically secure random bytes.
pub fn generate_random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generate a new Ed25519 signing keypair.
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key)
}

// =============================================================================
// Key Derivation
// =============================================================================

/// Derive a 256-bit key with HKDF-SHA256.
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(info, &mut okm[..])
        .map_err(|e| KmsError::Crypto(format!("Key derivation failed: {e}")))?;
    Ok(okm)
}

// =============================================================================
// Authenticated Encryption
// =============================================================================

/// Encrypt `plaintext` under `key`, binding `aad`.
///
/// Returns ciphertext with the 16-byte auth tag appended.
pub fn seal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| KmsError::Crypto(format!("Encryption failed: {e}")))
}

/// Decrypt and authenticate. A wrong key, nonce, AAD or any tampering fails.
pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| KmsError::Crypto("Authenticated decryption failed".into()))
}

/// Copy a slice into a fixed nonce, rejecting the wrong length.
pub fn nonce_from_slice(bytes: &[u8]) -> Result<[u8; NONCE_LEN]> {
    bytes
        .try_into()
        .map_err(|_| KmsError::Validation(format!("nonce must be {} bytes", NONCE_LEN)))
}

// =============================================================================
// Signing
// =============================================================================

/// Sign a payload with an Ed25519 private key.
pub fn sign_payload(signing_key: &SigningKey, payload: &[u8]) -> Signature {
    signing_key.sign(payload)
}

/// Verify an Ed25519 signature. Returns `false` for a well-formed but wrong signature.
pub fn verify_payload(verifying_key: &VerifyingKey, payload: &[u8], signature: &[u8]) -> Result<bool> {
    let bytes: [u8; SIGNATURE_LEN] = signature.try_into().map_err(|_| {
        KmsError::Validation(format!("signature must be {} bytes", SIGNATURE_LEN))
    })?;
    let signature = Signature::from_bytes(&bytes);
    Ok(verifying_key.verify(payload, &signature).is_ok())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let bytes1: [u8; 16] = generate_random_bytes();
        let bytes2: [u8; 16] = generate_random_bytes();
        assert_ne!(bytes1, bytes2);
    }

    #[test]
    fn test_derive_key_is_deterministic_per_salt() {
        let ikm = [7u8; 32];
        let k1 = derive_key(&ikm, b"ks-1", b"info").unwrap();
        let k2 = derive_key(&ikm, b"ks-1", b"info").unwrap();
        let k3 = derive_key(&ikm, b"ks-2", b"info").unwrap();
        assert_eq!(*k1, *k2);
        assert_ne!(*k1, *k3);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key: [u8; KEY_LEN] = generate_random_bytes();
        let nonce: [u8; NONCE_LEN] = generate_random_bytes();

        let ciphertext = seal(&key, &nonce, b"private key bytes", b"aad").unwrap();
        assert_eq!(ciphertext.len(), 17 + AUTH_TAG_LEN);

        let plaintext = open(&key, &nonce, &ciphertext, b"aad").unwrap();
        assert_eq!(plaintext.as_slice(), b"private key bytes");
    }

    #[test]
    fn test_open_with_wrong_aad_fails() {
        let key: [u8; KEY_LEN] = generate_random_bytes();
        let nonce: [u8; NONCE_LEN] = generate_random_bytes();

        let ciphertext = seal(&key, &nonce, b"secret", b"keystore-a").unwrap();
        assert!(open(&key, &nonce, &ciphertext, b"keystore-b").is_err());

        let other: [u8; KEY_LEN] = generate_random_bytes();
        assert!(open(&other, &nonce, &ciphertext, b"keystore-a").is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let (signing_key, verifying_key) = generate_keypair();
        let signature = sign_payload(&signing_key, b"hello");

        assert!(verify_payload(&verifying_key, b"hello", &signature.to_bytes()).unwrap());
        assert!(!verify_payload(&verifying_key, b"hellO", &signature.to_bytes()).unwrap());
        assert!(verify_payload(&verifying_key, b"hello", &[0u8; 3]).is_err());
    }
}
