//! Capabilities
//!
//! ZCAP-style authorization records. The issuer signs every capability with
//! the service key; a delegated capability names its parent by ID, and
//! verification walks those IDs back to a root issued by this service.

pub mod codec;
pub mod issuer;
pub mod model;
pub mod verifier;

pub use issuer::CapabilityIssuer;
pub use model::{Action, Capability, Proof};
pub use verifier::{did_key, verify_chain, IssuerIdentity, MAX_CHAIN_DEPTH};
