//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling. Every request runs
//! under the configured deadline; a request that overruns it is dropped,
//! which drops any ephemeral key material it was holding.

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::auth::BearerAuth;
use crate::dispatcher::KmsService;
use crate::routes;
use crate::types::{KmsError, Result};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared application state
pub struct AppState {
    pub service: Arc<KmsService>,
    pub auth: BearerAuth,
    /// Prefix for returned keystore and key URLs
    pub base_url: String,
    pub enable_cors: bool,
    pub request_timeout: Duration,
}

/// Start the HTTP server
pub async fn run(state: Arc<AppState>, host_url: &str) -> Result<()> {
    let listener = TcpListener::bind(host_url).await?;
    info!("KMS listening on {}", host_url);
    serve(state, listener).await
}

/// Accept connections on an already bound listener.
pub async fn serve(state: Arc<AppState>, listener: TcpListener) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("[{}] {} {}", addr, method, path);

    if state.enable_cors && method == Method::OPTIONS {
        return Ok(routes::with_cors(routes::cors_preflight()));
    }

    let response = match tokio::time::timeout(
        state.request_timeout,
        routes::route(Arc::clone(&state), req),
    )
    .await
    {
        Ok(response) => response,
        Err(_) => routes::error_response(&KmsError::Timeout(format!("{} {}", method, path))),
    };

    if state.enable_cors {
        Ok(routes::with_cors(response))
    } else {
        Ok(response)
    }
}
