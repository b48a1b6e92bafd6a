//! Service master key.
//!
//! Loaded once at startup from the secret-lock key file. It seals server-held
//! shares at rest and seeds the capability-issuing key. It never wraps user
//! keys directly: those need both shares.

use std::path::Path;

use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{derive_key, generate_random_bytes, nonce_from_slice, open, seal, KEY_LEN, NONCE_LEN};
use crate::types::{KmsError, Result};

const SHARE_SEAL_INFO: &[u8] = b"kms/share-seal/v1";

/// Ciphertext of a server-held share, as stored in the user-keys store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealedShare {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// 256-bit master key, zeroized on drop.
pub struct MasterKey {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(bytes),
        }
    }

    /// Read and decode a base64 key file (URL or standard alphabet).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            KmsError::Config(format!(
                "failed to read secret lock key {}: {}",
                path.display(),
                e
            ))
        })?);

        Self::from_encoded(contents.trim())
    }

    pub fn from_encoded(encoded: &str) -> Result<Self> {
        if encoded.is_empty() {
            return Err(KmsError::Config("secret lock key file is empty".into()));
        }

        let decoded = Zeroizing::new(
            URL_SAFE
                .decode(encoded)
                .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
                .or_else(|_| STANDARD.decode(encoded))
                .map_err(|e| KmsError::Config(format!("invalid secret lock key encoding: {e}")))?,
        );

        let bytes: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            KmsError::Config(format!(
                "secret lock key must be {} bytes, got {}",
                KEY_LEN,
                decoded.len()
            ))
        })?;

        Ok(Self::from_bytes(bytes))
    }

    /// Derive a purpose-bound subkey.
    pub fn derive(&self, info: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        derive_key(self.key.as_slice(), b"kms-master", info)
    }

    /// Seal a server-held share for `owner`. The owner is bound as AAD.
    pub fn seal_share(&self, owner: &str, share: &[u8]) -> Result<SealedShare> {
        let key = self.derive(SHARE_SEAL_INFO)?;
        let nonce: [u8; NONCE_LEN] = generate_random_bytes();
        let ciphertext = seal(&key, &nonce, share, owner.as_bytes())?;
        Ok(SealedShare {
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    pub fn open_share(&self, owner: &str, sealed: &SealedShare) -> Result<Zeroizing<Vec<u8>>> {
        let key = self.derive(SHARE_SEAL_INFO)?;
        open(
            &key,
            &nonce_from_slice(&sealed.nonce)?,
            &sealed.ciphertext,
            owner.as_bytes(),
        )
        .map_err(|_| KmsError::InvalidShare("stored share could not be unsealed".into()))
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}
