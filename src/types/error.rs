//! Error types for the KMS
//!
//! Every failure a protected operation can produce maps to exactly one
//! variant here, and every variant maps to an HTTP status.

use hyper::StatusCode;

/// Reasons a capability chain is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("capability chain is broken")]
    ChainBroken,

    #[error("capability has expired")]
    Expired,

    #[error("action not allowed by capability")]
    ActionNotAllowed,

    #[error("capability invoker does not match caller")]
    InvokerMismatch,

    #[error("delegation exceeds parent scope")]
    ScopeViolation,
}

impl CapabilityError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ChainBroken => "CHAIN_BROKEN",
            Self::Expired => "CAPABILITY_EXPIRED",
            Self::ActionNotAllowed => "ACTION_NOT_ALLOWED",
            Self::InvokerMismatch => "INVOKER_MISMATCH",
            Self::ScopeViolation => "SCOPE_VIOLATION",
        }
    }
}

/// Main error type for KMS operations
#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Config(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid secret share: {0}")]
    InvalidShare(String),

    #[error("Capability rejected: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Keystore not found: {0}")]
    NotFound(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Version conflict on keystore {keystore_id}: expected {expected}, found {actual}")]
    VersionConflict {
        keystore_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("Crypto failure: {0}")]
    Crypto(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Remote service error: {0}")]
    Remote(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KmsError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedKeyType(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::InvalidShare(_) => StatusCode::UNAUTHORIZED,
            Self::Capability(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::KeyNotFound(_) => StatusCode::NOT_FOUND,
            Self::VersionConflict { .. } => StatusCode::CONFLICT,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Remote(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code for JSON error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::UnsupportedKeyType(_) => "UNSUPPORTED_KEY_TYPE",
            Self::Config(_) => "CONFIG",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::InvalidShare(_) => "INVALID_SHARE",
            Self::Capability(e) => e.code(),
            Self::NotFound(_) => "NOT_FOUND",
            Self::KeyNotFound(_) => "KEY_NOT_FOUND",
            Self::VersionConflict { .. } => "VERSION_CONFLICT",
            Self::Conflict(_) => "CONFLICT",
            Self::Crypto(_) => "CRYPTO",
            Self::Storage(_) => "STORAGE",
            Self::Remote(_) => "REMOTE",
            Self::Timeout(_) => "TIMEOUT",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// True for the authorization class: bad shares, rejected capabilities, bad tokens.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized(_) | Self::InvalidShare(_) | Self::Capability(_)
        )
    }
}

impl From<std::io::Error> for KmsError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for KmsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for KmsError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<mongodb::error::Error> for KmsError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<bson::ser::Error> for KmsError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Storage(format!("BSON encode error: {}", err))
    }
}

impl From<reqwest::Error> for KmsError {
    fn from(err: reqwest::Error) -> Self {
        Self::Remote(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for KmsError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Unauthorized(format!("JWT error: {}", err))
    }
}

/// Result type alias for KMS operations
pub type Result<T> = std::result::Result<T, KmsError>;
