//! Health check endpoint
//!
//! `GET /healthcheck` returns 200 while the process is serving requests.

use chrono::Utc;
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::json_response;
use crate::server::BoxBody;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// RFC 3339 timestamp
    pub current_time: String,
}

pub fn health_check() -> Response<BoxBody> {
    json_response(
        StatusCode::OK,
        &HealthResponse {
            status: "success",
            current_time: Utc::now().to_rfc3339(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_health_check() {
        let response = health_check();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "success");
        assert!(json["current_time"].is_string());
    }
}
