//! Remote collaborators: the auth service holding server shares and the
//! Encrypted Data Vault.

pub mod auth;
pub mod vault;

use std::time::Duration;

pub use auth::{LocalShareSource, RemoteAuthShareSource, ServerShareSource};
pub use vault::{HttpVaultClient, VaultClient, VaultDocument};

use crate::types::{KmsError, Result};

/// Outbound TLS trust settings.
#[derive(Debug, Clone, Default)]
pub struct TlsTrust {
    /// PEM bundles read from `tls-cacerts` at startup
    pub ca_certs: Vec<Vec<u8>>,
    pub use_system_pool: bool,
}

/// Shared HTTP client for the auth service and vault.
pub fn build_http_client(tls: &TlsTrust, timeout: Duration) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent("kms/1.0")
        .tls_built_in_root_certs(tls.use_system_pool || tls.ca_certs.is_empty());

    for pem in &tls.ca_certs {
        let certificate = reqwest::Certificate::from_pem(pem)
            .map_err(|e| KmsError::Config(format!("invalid CA certificate: {e}")))?;
        builder = builder.add_root_certificate(certificate);
    }

    builder
        .build()
        .map_err(|e| KmsError::Config(format!("failed to build HTTP client: {e}")))
}
