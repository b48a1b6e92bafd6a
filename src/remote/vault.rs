//! Encrypted Data Vault client.
//!
//! The service never holds vault credentials of its own. Each write is
//! authorized by the capability the keystore owner delegated when binding
//! the vault.

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::keystore::{KeyRecord, VaultBinding};
use crate::types::{base64_bytes, option_base64_bytes, KmsError, Result};

/// Wrapped key document mirrored into the vault.
#[derive(Debug, Clone, Serialize)]
pub struct VaultDocument {
    pub id: String,
    pub keystore_id: String,
    pub key_type: String,
    #[serde(with = "base64_bytes")]
    pub wrapped: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "option_base64_bytes", skip_serializing_if = "Option::is_none")]
    pub public_key: Option<Vec<u8>>,
}

impl VaultDocument {
    pub fn from_key(keystore_id: &str, key: &KeyRecord) -> Self {
        Self {
            id: key.id.clone(),
            keystore_id: keystore_id.to_string(),
            key_type: key.key_type.to_string(),
            wrapped: key.wrapped.clone(),
            nonce: key.nonce.clone(),
            public_key: key.public_key.clone(),
        }
    }
}

#[async_trait]
pub trait VaultClient: Send + Sync {
    async fn write_document(&self, binding: &VaultBinding, document: &VaultDocument) -> Result<()>;

    /// Remove a document written for a key whose local commit failed.
    async fn delete_document(&self, binding: &VaultBinding, document_id: &str) -> Result<()>;
}

/// `Capability-Invocation` header value for a vault request.
pub fn invocation_header(capability: &str, action: &str) -> String {
    format!("zcap capability=\"{capability}\",action=\"{action}\"")
}

pub struct HttpVaultClient {
    http_client: reqwest::Client,
}

impl HttpVaultClient {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl VaultClient for HttpVaultClient {
    async fn write_document(&self, binding: &VaultBinding, document: &VaultDocument) -> Result<()> {
        let url = format!("{}/documents", binding.vault_url.trim_end_matches('/'));
        debug!(url = %url, document_id = %document.id, "Writing document to vault");

        let response = self
            .http_client
            .post(&url)
            .header("Capability-Invocation", invocation_header(&binding.capability, "write"))
            .json(document)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(KmsError::Remote(format!(
                "vault returned HTTP {} for {}",
                response.status(),
                url
            )));
        }
        Ok(())
    }

    async fn delete_document(&self, binding: &VaultBinding, document_id: &str) -> Result<()> {
        let url = format!(
            "{}/documents/{}",
            binding.vault_url.trim_end_matches('/'),
            document_id
        );
        debug!(url = %url, "Deleting document from vault");

        let response = self
            .http_client
            .delete(&url)
            .header("Capability-Invocation", invocation_header(&binding.capability, "delete"))
            .send()
            .await?;

        // Already gone counts as deleted
        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            return Err(KmsError::Remote(format!(
                "vault returned HTTP {} for DELETE {}",
                status, url
            )));
        }
        Ok(())
    }
}
