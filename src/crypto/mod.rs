//! Cryptographic building blocks
//!
//! `primitives` holds the algorithm-level helpers; `keys` maps each supported
//! key type onto them.

pub mod keys;
pub mod primitives;

pub use keys::{GeneratedKey, KeyType};
pub use primitives::{
    derive_key, generate_keypair, generate_random_bytes, nonce_from_slice, open, seal,
    sign_payload, verify_payload, KEY_LEN, NONCE_LEN,
};
