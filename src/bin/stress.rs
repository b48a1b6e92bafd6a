//! KMS stress tool
//!
//! Drives the HTTP API through the bounded worker pool. Each task registers a
//! fresh server share, creates a keystore and a signing key, signs a message
//! `--sign-times` times and verifies the last signature. Latencies are
//! reported per phase once every task has finished.

use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use kms::{
    auth::JwtValidator,
    routes::SECRET_SHARE_HEADER,
    secret_lock::{generate_secret, split_secret},
    worker::{PoolConfig, WorkerPool},
    KmsError, Result,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "kms-stress")]
#[command(about = "Load generator for the KMS REST API")]
struct Args {
    /// KMS base URL
    #[arg(long, env = "KMS_STRESS_URL", default_value = "http://localhost:8076")]
    url: String,

    /// Number of create-keystore/create-key/sign/verify flows
    #[arg(long, env = "KMS_STRESS_TOTAL_REQUESTS", default_value = "100")]
    total_requests: usize,

    /// Flows in flight at once
    #[arg(long, env = "KMS_STRESS_CONCURRENCY", default_value = "10")]
    concurrency: usize,

    #[arg(long, env = "KMS_STRESS_SIGN_TIMES", default_value = "1")]
    sign_times: usize,

    #[arg(long, env = "KMS_STRESS_KEY_TYPE", default_value = "ED25519")]
    key_type: String,

    /// Principal prefix; flow `i` runs as `<prefix>-<i>` and controls its keystore
    #[arg(long, env = "KMS_STRESS_SUBJECT_PREFIX", default_value = "did:example:stress")]
    subject_prefix: String,

    /// Mint HS256 bearer tokens with this secret. Opaque tokens otherwise.
    #[arg(long, env = "KMS_STRESS_JWT_SECRET")]
    jwt_secret: Option<String>,

    #[arg(long, env = "KMS_STRESS_TIMEOUT_SECS", default_value = "30")]
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct CreateKeystoreResponse {
    key_store_url: String,
}

#[derive(Debug, Deserialize)]
struct KeyUrlResponse {
    key_url: String,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    verified: bool,
}

/// Per-phase latencies of one flow.
#[derive(Debug, Default)]
struct FlowTimings {
    create_keystore: Duration,
    create_key: Duration,
    sign: Vec<Duration>,
    verify: Duration,
}

struct Flow {
    client: reqwest::Client,
    base_url: String,
    token: String,
    controller: String,
    key_type: String,
    sign_times: usize,
}

impl Flow {
    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        share: Option<&str>,
        body: serde_json::Value,
    ) -> Result<T> {
        let mut request = self.client.post(url).bearer_auth(&self.token).json(&body);
        if let Some(share) = share {
            request = request.header(SECRET_SHARE_HEADER, share);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(KmsError::Remote(format!("POST {url} returned {status}: {text}")));
        }
        Ok(response.json().await?)
    }

    async fn run(self) -> Result<FlowTimings> {
        let mut timings = FlowTimings::default();

        let secret = generate_secret();
        let (client_share, server_share) = split_secret(&secret);
        let client_share = STANDARD.encode(client_share.as_bytes());

        let response = self
            .client
            .post(format!("{}/secret", self.base_url))
            .bearer_auth(&self.token)
            .json(&json!({ "secret": STANDARD.encode(server_share.as_bytes()) }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(KmsError::Remote(format!(
                "storing server share returned {}",
                response.status()
            )));
        }

        let started = Instant::now();
        let keystore: CreateKeystoreResponse = self
            .post(
                &format!("{}/v1/keystores", self.base_url),
                None,
                json!({ "controller": self.controller }),
            )
            .await?;
        timings.create_keystore = started.elapsed();

        let started = Instant::now();
        let key: KeyUrlResponse = self
            .post(
                &format!("{}/keys", keystore.key_store_url),
                Some(&client_share),
                json!({ "key_type": self.key_type }),
            )
            .await?;
        timings.create_key = started.elapsed();

        let message = STANDARD.encode(b"stress test message");
        let mut signature = String::new();
        for _ in 0..self.sign_times.max(1) {
            let started = Instant::now();
            let signed: SignResponse = self
                .post(
                    &format!("{}/sign", key.key_url),
                    Some(&client_share),
                    json!({ "message": message }),
                )
                .await?;
            timings.sign.push(started.elapsed());
            signature = signed.signature;
        }

        let started = Instant::now();
        let verified: VerifyResponse = self
            .post(
                &format!("{}/verify", key.key_url),
                None,
                json!({ "message": message, "signature": signature }),
            )
            .await?;
        timings.verify = started.elapsed();

        if !verified.verified {
            return Err(KmsError::Crypto(format!(
                "signature from {} did not verify",
                key.key_url
            )));
        }

        Ok(timings)
    }
}

/// avg/min/max of a set of samples.
fn summarize(label: &str, samples: &[Duration]) {
    if samples.is_empty() {
        info!("{:<16} no samples", label);
        return;
    }
    let total: Duration = samples.iter().sum();
    let avg = total / samples.len() as u32;
    let min = samples.iter().min().copied().unwrap_or_default();
    let max = samples.iter().max().copied().unwrap_or_default();
    info!(
        "{:<16} n={:<6} avg={:>10.3?} min={:>10.3?} max={:>10.3?}",
        label,
        samples.len(),
        avg,
        min,
        max
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kms=info,kms_stress=info,info".into()),
        )
        .init();

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout_secs))
        .build()?;
    let validator = args
        .jwt_secret
        .clone()
        .map(|secret| JwtValidator::new(secret, 3600))
        .transpose()?;
    let base_url = args.url.trim_end_matches('/').to_string();

    info!(
        "totalRequests: {}, concurrency: {}, signTimes: {}",
        args.total_requests, args.concurrency, args.sign_times
    );

    let mut pool = WorkerPool::new(PoolConfig {
        worker_count: args.concurrency,
        max_queue_size: args.concurrency.max(1) * 2,
    });

    let started = Instant::now();
    for i in 0..args.total_requests {
        let subject = format!("{}-{i}", args.subject_prefix);
        let token = match &validator {
            Some(v) => v.generate_token(&subject)?,
            None => subject.clone(),
        };
        let flow = Flow {
            client: client.clone(),
            base_url: base_url.clone(),
            token,
            controller: subject,
            key_type: args.key_type.clone(),
            sign_times: args.sign_times,
        };
        pool.submit(flow.run()).await?;
    }

    let results = pool.drain().await;
    let elapsed = started.elapsed();

    let mut create_keystore = Vec::new();
    let mut create_key = Vec::new();
    let mut sign = Vec::new();
    let mut verify = Vec::new();
    let mut flows = Vec::new();
    for outcome in &results.outcomes {
        flows.push(outcome.latency);
        if let Ok(timings) = &outcome.result {
            create_keystore.push(timings.create_keystore);
            create_key.push(timings.create_key);
            sign.extend_from_slice(&timings.sign);
            verify.push(timings.verify);
        }
    }

    info!(
        "Completed {} flows in {:.3?} ({} failed)",
        results.len(),
        elapsed,
        results.failures()
    );
    summarize("flow", &flows);
    summarize("create-keystore", &create_keystore);
    summarize("create-key", &create_key);
    summarize("sign", &sign);
    summarize("verify", &verify);

    if let Some(e) = results.first_error() {
        error!("First failure: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
