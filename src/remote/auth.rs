//! Server-held share sources.
//!
//! The server half of a principal's secret either lives with an external
//! auth service, fetched per request with the caller's bearer token, or in
//! the local user-keys storage sealed under the master key.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::db::ShareStore;
use crate::secret_lock::{MasterKey, SealedShare, SecretShare};
use crate::types::{base64_bytes, KmsError, Result};

#[async_trait]
pub trait ServerShareSource: Send + Sync {
    /// Server-held share for `owner`. `token` is the caller's bearer token.
    async fn fetch(&self, owner: &str, token: &str) -> Result<SecretShare>;

    /// Record the server-held share for `owner`.
    async fn store(&self, owner: &str, share: &[u8]) -> Result<()>;
}

#[derive(Deserialize)]
struct SecretResponse {
    #[serde(with = "base64_bytes")]
    secret: Vec<u8>,
}

/// Fetches the server share from the auth service's `/secret` endpoint.
pub struct RemoteAuthShareSource {
    base_url: String,
    http_client: reqwest::Client,
}

impl RemoteAuthShareSource {
    pub fn new(base_url: &str, http_client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        }
    }
}

#[async_trait]
impl ServerShareSource for RemoteAuthShareSource {
    async fn fetch(&self, owner: &str, token: &str) -> Result<SecretShare> {
        let url = format!("{}/secret", self.base_url);
        debug!(owner, url = %url, "Fetching server share from auth service");

        let response = self
            .http_client
            .get(&url)
            .header("Authorization", format!("Bearer {}", STANDARD.encode(token)))
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(KmsError::Unauthorized(
                    "auth service rejected the bearer token".into(),
                ));
            }
            StatusCode::NOT_FOUND => {
                return Err(KmsError::InvalidShare("no server share for principal".into()));
            }
            s => {
                return Err(KmsError::Remote(format!("auth service returned HTTP {s}")));
            }
        }

        let body: SecretResponse = response.json().await?;
        Ok(SecretShare::server(body.secret))
    }

    async fn store(&self, _owner: &str, _share: &[u8]) -> Result<()> {
        Err(KmsError::Validation(
            "server shares are managed by the auth service".into(),
        ))
    }
}

/// Keeps server shares in the user-keys storage.
pub struct LocalShareSource {
    store: Arc<dyn ShareStore>,
    master: Option<Arc<MasterKey>>,
}

impl LocalShareSource {
    pub fn new(store: Arc<dyn ShareStore>, master: Option<Arc<MasterKey>>) -> Self {
        if master.is_none() {
            warn!("No secret lock key configured, server shares are stored unsealed");
        }
        Self { store, master }
    }
}

#[async_trait]
impl ServerShareSource for LocalShareSource {
    async fn fetch(&self, owner: &str, _token: &str) -> Result<SecretShare> {
        let sealed = self
            .store
            .get(owner)
            .await?
            .ok_or_else(|| KmsError::InvalidShare("no server share for principal".into()))?;

        match (&self.master, sealed.nonce.is_empty()) {
            (Some(master), false) => {
                let bytes = master.open_share(owner, &sealed)?;
                Ok(SecretShare::server(bytes.to_vec()))
            }
            (None, true) => Ok(SecretShare::server(sealed.ciphertext)),
            _ => Err(KmsError::Config(
                "stored share sealing does not match the configured secret lock key".into(),
            )),
        }
    }

    async fn store(&self, owner: &str, share: &[u8]) -> Result<()> {
        let sealed = match &self.master {
            Some(master) => master.seal_share(owner, share)?,
            None => SealedShare {
                nonce: Vec::new(),
                ciphertext: share.to_vec(),
            },
        };
        self.store.put(owner, &sealed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryShareStore;

    #[tokio::test]
    async fn test_local_source_seals_at_rest() {
        let store = Arc::new(MemoryShareStore::new());
        let master = Arc::new(MasterKey::from_bytes([3u8; 32]));
        let source = LocalShareSource::new(store.clone(), Some(master));

        source.store("alice", &[5u8; 41]).await.unwrap();

        let raw = store.get("alice").await.unwrap().unwrap();
        assert_ne!(raw.ciphertext, vec![5u8; 41]);

        let share = source.fetch("alice", "token").await.unwrap();
        assert_eq!(share.as_bytes(), &[5u8; 41][..]);
    }

    #[tokio::test]
    async fn test_local_source_without_master() {
        let source = LocalShareSource::new(Arc::new(MemoryShareStore::new()), None);
        source.store("bob", &[1, 2, 3]).await.unwrap();
        assert_eq!(source.fetch("bob", "t").await.unwrap().as_bytes(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn test_missing_share_is_invalid_share() {
        let source = LocalShareSource::new(Arc::new(MemoryShareStore::new()), None);
        assert!(matches!(
            source.fetch("nobody", "t").await,
            Err(KmsError::InvalidShare(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_source_refuses_store() {
        let source = RemoteAuthShareSource::new("http://localhost:1/", reqwest::Client::new());
        assert_eq!(source.base_url, "http://localhost:1");
        assert!(source.store("alice", &[1]).await.is_err());
    }
}
