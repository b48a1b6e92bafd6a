//! Shared types

pub mod encoding;
pub mod error;

pub use encoding::{base64_bytes, option_base64_bytes};
pub use error::{CapabilityError, KmsError, Result};
