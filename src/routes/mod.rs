//! HTTP route handlers
//!
//! Handlers return `Result<Response<BoxBody>>`; [`route`] turns any error
//! into a JSON `{error, code}` body with the error's status.

pub mod health;
pub mod keystores;

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::server::{AppState, BoxBody};
use crate::types::{KmsError, Result};

pub use health::health_check;

/// Prefix for every keystore route.
pub const API_PREFIX: &str = "/v1";

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub const SECRET_SHARE_HEADER: &str = "Secret-Share";
pub const CAPABILITY_HEADER: &str = "Capability";

const CORS_ALLOW_HEADERS: &str = "Content-Type, Authorization, Secret-Share, Capability";

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

// =============================================================================
// Response Helpers
// =============================================================================

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<BoxBody> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full_body(json))
        .unwrap()
}

pub fn empty_response(status: StatusCode) -> Response<BoxBody> {
    Response::builder().status(status).body(empty_body()).unwrap()
}

pub fn error_response(err: &KmsError) -> Response<BoxBody> {
    let status = err.status_code();
    if status.is_server_error() {
        warn!(code = err.code(), "Request failed: {}", err);
    } else {
        debug!(code = err.code(), "Request rejected: {}", err);
    }

    json_response(
        status,
        &ErrorResponse {
            error: err.to_string(),
            code: Some(err.code().to_string()),
        },
    )
}

fn not_found(path: &str) -> Response<BoxBody> {
    json_response(
        StatusCode::NOT_FOUND,
        &ErrorResponse {
            error: format!("No route for {}", path),
            code: Some("NOT_FOUND".into()),
        },
    )
}

pub fn cors_preflight() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Access-Control-Max-Age", "86400")
        .body(empty_body())
        .unwrap()
}

/// Attach CORS headers to a response.
pub fn with_cors(mut response: Response<BoxBody>) -> Response<BoxBody> {
    let headers = response.headers_mut();
    headers.insert(
        "Access-Control-Allow-Origin",
        hyper::header::HeaderValue::from_static("*"),
    );
    headers.insert(
        "Access-Control-Allow-Methods",
        hyper::header::HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        hyper::header::HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    response
}

// =============================================================================
// Request Helpers
// =============================================================================

pub async fn parse_json_body<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T> {
    let body = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| KmsError::Validation(format!("Failed to read body: {}", e)))?;

    serde_json::from_slice(&body.to_bytes())
        .map_err(|e| KmsError::Validation(format!("Invalid JSON: {}", e)))
}

pub fn get_header<'a>(req: &'a Request<Incoming>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

// =============================================================================
// Router
// =============================================================================

/// Dispatch a request to its handler.
pub async fn route(state: Arc<AppState>, req: Request<Incoming>) -> Response<BoxBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let prefix = API_PREFIX.trim_matches('/');

    let result = match (&method, segments.as_slice()) {
        (&Method::GET, ["healthcheck"]) => Ok(health_check()),

        (&Method::POST, ["secret"]) => keystores::store_secret(state, req).await,

        (&Method::POST, [p, "keystores"]) if *p == prefix => {
            keystores::create_keystore(state, req).await
        }
        (&Method::POST, [p, "keystores", ks, "keys"]) if *p == prefix => {
            keystores::create_key(state, req, ks).await
        }
        (&Method::POST, [p, "keystores", ks, "capability"]) if *p == prefix => {
            keystores::delegate(state, req, ks).await
        }
        (&Method::GET, [p, "keystores", ks, "keys", key, "export"]) if *p == prefix => {
            keystores::export_public_key(state, req, ks, key).await
        }
        (&Method::POST, [p, "keystores", ks, "keys", key, op]) if *p == prefix => match *op {
            "sign" => keystores::sign(state, req, ks, key).await,
            "verify" => keystores::verify(state, req, ks, key).await,
            "encrypt" => keystores::encrypt(state, req, ks, key).await,
            "decrypt" => keystores::decrypt(state, req, ks, key).await,
            "rotate" => keystores::rotate(state, req, ks, key).await,
            _ => Ok(not_found(&path)),
        },

        _ => Ok(not_found(&path)),
    };

    result.unwrap_or_else(|e| error_response(&e))
}
