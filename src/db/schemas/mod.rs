//! MongoDB document schemas

mod capability;
mod keystore;
mod metadata;
mod secret;

pub use capability::{CapabilityDoc, CAPABILITY_COLLECTION};
pub use keystore::{KeystoreDoc, KEYSTORE_COLLECTION};
pub use metadata::Metadata;
pub use secret::{SecretDoc, SECRET_COLLECTION};
