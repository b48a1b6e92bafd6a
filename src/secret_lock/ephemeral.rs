//! Request-scoped wrapping key.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{derive_key, KEY_LEN};
use crate::types::Result;

const WRAPPING_KEY_INFO: &[u8] = b"kms/keystore-wrapping-key/v1";

/// Key-wrapping key derived from a reconstructed keystore secret.
///
/// Lives for one operation only. Not `Clone`, not serializable, and the
/// bytes are overwritten when the guard is dropped on any exit path.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EphemeralKey {
    bytes: [u8; KEY_LEN],
}

impl EphemeralKey {
    /// Derive the wrapping key for `keystore_id` from the reconstructed secret.
    pub fn derive(secret: &[u8], keystore_id: &str) -> Result<Self> {
        let okm = derive_key(secret, keystore_id.as_bytes(), WRAPPING_KEY_INFO)?;
        Ok(Self { bytes: *okm })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EphemeralKey(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_bound_to_keystore() {
        let secret = [3u8; 32];
        let a = EphemeralKey::derive(&secret, "ks-a").unwrap();
        let a2 = EphemeralKey::derive(&secret, "ks-a").unwrap();
        let b = EphemeralKey::derive(&secret, "ks-b").unwrap();

        assert_eq!(a.as_bytes(), a2.as_bytes());
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_zeroize_clears_bytes() {
        let mut key = EphemeralKey::derive(&[9u8; 32], "ks").unwrap();
        key.zeroize();
        assert_eq!(key.as_bytes(), &[0u8; KEY_LEN]);
        assert_eq!(format!("{:?}", key), "EphemeralKey(<redacted>)");
    }
}
