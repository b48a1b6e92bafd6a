//! Keystore and key endpoints
//!
//! - `POST /v1/keystores` - create keystore, returns root capability
//! - `POST /v1/keystores/{ks}/keys` - create key
//! - `GET  /v1/keystores/{ks}/keys/{key}/export` - export public key
//! - `POST /v1/keystores/{ks}/keys/{key}/{sign|verify|encrypt|decrypt|rotate}`
//! - `POST /v1/keystores/{ks}/capability` - delegate a capability
//! - `POST /secret` - store the caller's server share (local share mode)
//!
//! Byte fields are standard base64 strings.

use std::collections::BTreeSet;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{
    get_header, json_response, parse_json_body, API_PREFIX, CAPABILITY_HEADER,
    SECRET_SHARE_HEADER,
};
use crate::capability::{codec, Action};
use crate::dispatcher::Invocation;
use crate::keystore::VaultBinding;
use crate::server::{AppState, BoxBody};
use crate::types::{base64_bytes, option_base64_bytes, KmsError, Result};

// =============================================================================
// Request / Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateKeystoreRequest {
    pub controller: String,
    #[serde(default)]
    pub edv: Option<VaultBinding>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateKeystoreResponse {
    pub key_store_url: String,
    /// Root capability, base64 of gzip-compressed JSON
    pub capability: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub key_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyUrlResponse {
    pub key_url: String,
}

#[derive(Debug, Deserialize)]
pub struct SignRequest {
    #[serde(with = "base64_bytes")]
    pub message: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignResponse {
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(with = "base64_bytes")]
    pub message: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub verified: bool,
}

#[derive(Debug, Deserialize)]
pub struct EncryptRequest {
    #[serde(with = "base64_bytes")]
    pub message: Vec<u8>,
    #[serde(default, with = "option_base64_bytes")]
    pub aad: Option<Vec<u8>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EncryptResponse {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct DecryptRequest {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(default, with = "option_base64_bytes")]
    pub aad: Option<Vec<u8>>,
}

#[derive(Serialize)]
struct DecryptResponse<'a> {
    #[serde(with = "base64_bytes")]
    plaintext: &'a [u8],
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExportResponse {
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct DelegateRequest {
    pub invoker: String,
    pub allowed_actions: BTreeSet<Action>,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DelegateResponse {
    pub capability: String,
}

#[derive(Debug, Deserialize)]
pub struct SecretRequest {
    #[serde(with = "base64_bytes")]
    pub secret: Vec<u8>,
}

// =============================================================================
// Helpers
// =============================================================================

fn invocation(state: &AppState, req: &Request<Incoming>) -> Result<Invocation> {
    let principal = state
        .auth
        .authenticate(get_header(req, hyper::header::AUTHORIZATION.as_str()))?;
    let invocation = Invocation::new(principal);

    match get_header(req, CAPABILITY_HEADER) {
        Some(encoded) => Ok(invocation.with_capability(codec::decode(encoded)?)),
        None => Ok(invocation),
    }
}

/// Decoded `Secret-Share` header. Absent is `None`; undecodable is `InvalidShare`.
fn client_share(req: &Request<Incoming>) -> Result<Option<Zeroizing<Vec<u8>>>> {
    get_header(req, SECRET_SHARE_HEADER)
        .map(|encoded| {
            STANDARD
                .decode(encoded.trim())
                .map(Zeroizing::new)
                .map_err(|_| KmsError::InvalidShare("Secret-Share header is not base64".into()))
        })
        .transpose()
}

fn keystore_url(state: &AppState, keystore_id: &str) -> String {
    format!("{}{}/keystores/{}", state.base_url, API_PREFIX, keystore_id)
}

fn key_url(state: &AppState, keystore_id: &str, key_id: &str) -> String {
    format!("{}/keys/{}", keystore_url(state, keystore_id), key_id)
}

fn created_with_location<T: Serialize>(location: &str, body: &T) -> Response<BoxBody> {
    let mut response = json_response(StatusCode::CREATED, body);
    if let Ok(value) = hyper::header::HeaderValue::from_str(location) {
        response.headers_mut().insert(hyper::header::LOCATION, value);
    }
    response
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn create_keystore(state: Arc<AppState>, req: Request<Incoming>) -> Result<Response<BoxBody>> {
    let inv = invocation(&state, &req)?;
    let body: CreateKeystoreRequest = parse_json_body(req).await?;

    let created = state
        .service
        .create_keystore(&inv, &body.controller, body.edv)
        .await?;

    let url = keystore_url(&state, &created.keystore_id);
    Ok(created_with_location(
        &url,
        &CreateKeystoreResponse {
            key_store_url: url.clone(),
            capability: created.capability,
        },
    ))
}

pub async fn create_key(
    state: Arc<AppState>,
    req: Request<Incoming>,
    keystore_id: &str,
) -> Result<Response<BoxBody>> {
    let inv = invocation(&state, &req)?;
    let share = client_share(&req)?;
    let body: CreateKeyRequest = parse_json_body(req).await?;

    let key_id = state
        .service
        .create_key(&inv, keystore_id, &body.key_type, share.as_deref().map(|s| s.as_slice()))
        .await?;

    let url = key_url(&state, keystore_id, &key_id);
    Ok(created_with_location(&url, &KeyUrlResponse { key_url: url.clone() }))
}

pub async fn export_public_key(
    state: Arc<AppState>,
    req: Request<Incoming>,
    keystore_id: &str,
    key_id: &str,
) -> Result<Response<BoxBody>> {
    let inv = invocation(&state, &req)?;
    let public_key = state
        .service
        .export_public_key(&inv, keystore_id, key_id)
        .await?;

    Ok(json_response(StatusCode::OK, &ExportResponse { public_key }))
}

pub async fn sign(
    state: Arc<AppState>,
    req: Request<Incoming>,
    keystore_id: &str,
    key_id: &str,
) -> Result<Response<BoxBody>> {
    let inv = invocation(&state, &req)?;
    let share = client_share(&req)?;
    let body: SignRequest = parse_json_body(req).await?;

    let signature = state
        .service
        .sign(&inv, keystore_id, key_id, share.as_deref().map(|s| s.as_slice()), &body.message)
        .await?;

    Ok(json_response(StatusCode::OK, &SignResponse { signature }))
}

pub async fn verify(
    state: Arc<AppState>,
    req: Request<Incoming>,
    keystore_id: &str,
    key_id: &str,
) -> Result<Response<BoxBody>> {
    let inv = invocation(&state, &req)?;
    let body: VerifyRequest = parse_json_body(req).await?;

    let verified = state
        .service
        .verify(&inv, keystore_id, key_id, &body.message, &body.signature)
        .await?;

    Ok(json_response(StatusCode::OK, &VerifyResponse { verified }))
}

pub async fn encrypt(
    state: Arc<AppState>,
    req: Request<Incoming>,
    keystore_id: &str,
    key_id: &str,
) -> Result<Response<BoxBody>> {
    let inv = invocation(&state, &req)?;
    let share = client_share(&req)?;
    let body: EncryptRequest = parse_json_body(req).await?;

    let ciphertext = state
        .service
        .encrypt(
            &inv,
            keystore_id,
            key_id,
            share.as_deref().map(|s| s.as_slice()),
            &body.message,
            body.aad.as_deref().unwrap_or_default(),
        )
        .await?;

    Ok(json_response(StatusCode::OK, &EncryptResponse { ciphertext }))
}

pub async fn decrypt(
    state: Arc<AppState>,
    req: Request<Incoming>,
    keystore_id: &str,
    key_id: &str,
) -> Result<Response<BoxBody>> {
    let inv = invocation(&state, &req)?;
    let share = client_share(&req)?;
    let body: DecryptRequest = parse_json_body(req).await?;

    let plaintext = state
        .service
        .decrypt(
            &inv,
            keystore_id,
            key_id,
            share.as_deref().map(|s| s.as_slice()),
            &body.ciphertext,
            body.aad.as_deref().unwrap_or_default(),
        )
        .await?;

    Ok(json_response(
        StatusCode::OK,
        &DecryptResponse {
            plaintext: &plaintext,
        },
    ))
}

pub async fn rotate(
    state: Arc<AppState>,
    req: Request<Incoming>,
    keystore_id: &str,
    key_id: &str,
) -> Result<Response<BoxBody>> {
    let inv = invocation(&state, &req)?;
    let share = client_share(&req)?;

    let new_key_id = state
        .service
        .rotate(&inv, keystore_id, key_id, share.as_deref().map(|s| s.as_slice()))
        .await?;

    let url = key_url(&state, keystore_id, &new_key_id);
    Ok(created_with_location(&url, &KeyUrlResponse { key_url: url.clone() }))
}

pub async fn delegate(
    state: Arc<AppState>,
    req: Request<Incoming>,
    keystore_id: &str,
) -> Result<Response<BoxBody>> {
    let inv = invocation(&state, &req)?;
    let body: DelegateRequest = parse_json_body(req).await?;

    let (_, capability) = state
        .service
        .delegate(&inv, keystore_id, &body.invoker, body.allowed_actions, body.expires)
        .await?;

    Ok(json_response(StatusCode::CREATED, &DelegateResponse { capability }))
}

pub async fn store_secret(state: Arc<AppState>, req: Request<Incoming>) -> Result<Response<BoxBody>> {
    let principal = state
        .auth
        .authenticate(get_header(&req, hyper::header::AUTHORIZATION.as_str()))?;
    let body: SecretRequest = parse_json_body(req).await?;
    let secret = Zeroizing::new(body.secret);

    state.service.store_secret(&principal, &secret).await?;
    Ok(super::empty_response(StatusCode::NO_CONTENT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_keystore_request_accepts_edv() {
        let body: CreateKeystoreRequest = serde_json::from_str(
            r#"{"controller":"did:example:123456789","edv":{"vault_url":"https://edv.example","capability":"H4sI"}}"#,
        )
        .unwrap();
        assert_eq!(body.controller, "did:example:123456789");
        assert_eq!(body.edv.unwrap().vault_url, "https://edv.example");
    }

    #[test]
    fn test_sign_request_decodes_base64() {
        let body: SignRequest = serde_json::from_str(r#"{"message":"aGVsbG8="}"#).unwrap();
        assert_eq!(body.message, b"hello");
    }

    #[test]
    fn test_delegate_request_actions() {
        let body: DelegateRequest = serde_json::from_str(
            r#"{"invoker":"did:example:bob","allowed_actions":["sign","verify"]}"#,
        )
        .unwrap();
        assert_eq!(body.allowed_actions.len(), 2);
        assert!(body.expires.is_none());
    }

    #[test]
    fn test_decrypt_response_encodes_plaintext() {
        let json = serde_json::to_value(DecryptResponse { plaintext: b"hi" }).unwrap();
        assert_eq!(json["plaintext"], "aGk=");
    }
}
