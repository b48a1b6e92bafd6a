//! Secret Lock
//!
//! Combines a caller-supplied share with the server-held share of the same
//! 2-of-2 split and turns the reconstructed secret into a request-scoped
//! wrapping key.
//!
//! # Flow
//!
//! 1. Caller sends its share in the `Secret-Share` header
//! 2. Server share comes from the auth service or the local share store
//! 3. `SecretLock::unlock` reconstructs, checks integrity and derives an
//!    [`EphemeralKey`] bound to the keystore ID
//! 4. The reconstructed secret is zeroized before `unlock` returns; the
//!    ephemeral key is zeroized when the caller drops it

pub mod ephemeral;
pub mod master;
pub mod shares;

pub use ephemeral::EphemeralKey;
pub use master::{MasterKey, SealedShare};
pub use shares::{
    combine, combine_shares, generate_secret, split_secret, SecretShare, ShareHolder, SECRET_LEN,
    SHARE_LEN,
};

use crate::types::Result;

/// Stateless combiner. Safe to call from any number of requests at once.
pub struct SecretLock;

impl SecretLock {
    /// Reconstruct the keystore secret and derive its wrapping key.
    pub fn unlock(
        client: &SecretShare,
        server: &SecretShare,
        keystore_id: &str,
    ) -> Result<EphemeralKey> {
        let secret = combine(client, server)?;
        EphemeralKey::derive(secret.as_slice(), keystore_id)
    }
}
