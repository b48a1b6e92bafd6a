//! Configuration for the KMS server
//!
//! Every option has a command line flag and an environment variable. The
//! flag wins when both are set. Resolution happens here rather than through
//! clap's `env` support so that an option left unset on both surfaces, or
//! set to a blank value, produces the exact startup messages operators and
//! deployment tooling match on.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::remote::TlsTrust;
use crate::secret_lock::MasterKey;
use crate::types::{KmsError, Result};

/// Default lifetime of cached keystore records.
const DEFAULT_CACHE_EXPIRATION: Duration = Duration::from_secs(10 * 60);

/// Default timeout for calls to the auth service and vault.
const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 3;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

const DEFAULT_CAPABILITY_EXPIRY_SECS: i64 = 365 * 24 * 60 * 60;

/// KMS REST server
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "kms-rest")]
#[command(about = "Key management service with split-secret key wrapping")]
pub struct Args {
    /// Address to listen on (host:port)
    #[arg(long = "host-url")]
    pub host_url: Option<String>,

    /// Public base URL used in returned keystore and key URLs
    #[arg(long = "base-url")]
    pub base_url: Option<String>,

    /// Log level (critical, error, warning, info, debug)
    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// Keystore metadata storage (mem, mongodb)
    #[arg(long = "database-type")]
    pub database_type: Option<String>,

    #[arg(long = "database-url")]
    pub database_url: Option<String>,

    /// Collection name prefix for keystore metadata
    #[arg(long = "database-prefix")]
    pub database_prefix: Option<String>,

    /// Storage for server shares and capabilities (mem, mongodb)
    #[arg(long = "user-keys-storage-type")]
    pub user_keys_storage_type: Option<String>,

    #[arg(long = "user-keys-storage-url")]
    pub user_keys_storage_url: Option<String>,

    #[arg(long = "user-keys-storage-prefix")]
    pub user_keys_storage_prefix: Option<String>,

    /// Comma-separated PEM files trusted for outbound TLS
    #[arg(long = "tls-cacerts")]
    pub tls_cacerts: Option<String>,

    /// Also trust the built-in root certificates
    #[arg(long = "tls-systemcertpool")]
    pub tls_systemcertpool: Option<String>,

    #[arg(long = "tls-serve-cert-path")]
    pub tls_serve_cert_path: Option<String>,

    #[arg(long = "tls-serve-key-path")]
    pub tls_serve_key_path: Option<String>,

    /// File holding the base64 encoded 32-byte master key
    #[arg(long = "secret-lock-key-path")]
    pub secret_lock_key_path: Option<String>,

    /// Auth service holding server shares. Local share storage when unset.
    #[arg(long = "hub-auth-url")]
    pub hub_auth_url: Option<String>,

    #[arg(long = "enable-cors")]
    pub enable_cors: Option<String>,

    /// Keystore cache lifetime (e.g. 30s, 10m, 1h)
    #[arg(long = "cache-expiration")]
    pub cache_expiration: Option<String>,

    #[arg(long = "did-domain")]
    pub did_domain: Option<String>,

    /// Outbound call timeout in seconds
    #[arg(long = "sync-timeout")]
    pub sync_timeout: Option<String>,

    /// HS256 secret for bearer tokens. Opaque tokens are accepted when unset.
    #[arg(long = "jwt-secret")]
    pub jwt_secret: Option<String>,

    #[arg(long = "request-timeout-ms")]
    pub request_timeout_ms: Option<String>,

    /// Root capability lifetime in seconds
    #[arg(long = "capability-expiry-secs")]
    pub capability_expiry_secs: Option<String>,
}

// =============================================================================
// Resolved configuration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "error" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            _ => None,
        }
    }

    /// `tracing` filter directive for this level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Critical | Self::Error => "error",
            Self::Warning => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageKind {
    Mem,
    MongoDb,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub kind: StorageKind,
    pub url: Option<String>,
    pub prefix: String,
}

#[derive(Debug)]
pub struct StartupConfig {
    pub host_url: String,
    pub base_url: String,
    pub log_level: LogLevel,
    /// Unrecognised log level that was replaced by `info`
    pub rejected_log_level: Option<String>,
    pub keystore_storage: StorageConfig,
    pub user_keys_storage: StorageConfig,
    pub tls: TlsTrust,
    pub tls_serve: Option<(PathBuf, PathBuf)>,
    pub master_key: Option<Arc<MasterKey>>,
    pub hub_auth_url: Option<String>,
    pub enable_cors: bool,
    pub cache_expiration: Duration,
    pub did_domain: Option<String>,
    pub sync_timeout: Duration,
    pub jwt_secret: Option<String>,
    pub request_timeout: Duration,
    pub capability_expiry: chrono::Duration,
}

// =============================================================================
// Resolution helpers
// =============================================================================

/// Flag value if given, else the environment variable. Blank is an error
/// attributed to whichever surface supplied it.
fn optional(
    flag: &str,
    env_key: &str,
    cli: Option<String>,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<Option<String>> {
    if let Some(value) = cli {
        if value.trim().is_empty() {
            return Err(KmsError::Config(format!("{flag} value is empty")));
        }
        return Ok(Some(value));
    }

    match env(env_key) {
        Some(value) if value.trim().is_empty() => {
            Err(KmsError::Config(format!("{env_key} value is empty")))
        }
        other => Ok(other),
    }
}

fn required(
    flag: &str,
    env_key: &str,
    cli: Option<String>,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<String> {
    optional(flag, env_key, cli, env)?.ok_or_else(|| {
        KmsError::Config(format!(
            "Neither {flag} (command line flag) nor {env_key} (environment variable) have been set."
        ))
    })
}

/// Boolean literals: 1, t, true, 0, f, false (any case).
fn parse_bool(flag: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Ok(true),
        "0" | "f" | "false" => Ok(false),
        _ => Err(KmsError::Config(format!(
            "{flag}: invalid boolean \"{value}\""
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| KmsError::Config(format!("{flag}: invalid number \"{value}\"")))
}

/// Durations such as `500ms`, `30s`, `10m`, `1h30m`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let mut rest = value.trim();
    if rest.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let amount: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.checked_mul(60)?),
            "h" => Duration::from_secs(amount.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(unit)?;
        rest = &rest[unit_len..];
    }
    Some(total)
}

fn storage(
    type_flag: (&str, &str, Option<String>),
    url_flag: (&str, &str, Option<String>),
    prefix_flag: (&str, &str, Option<String>),
    env: &impl Fn(&str) -> Option<String>,
) -> Result<StorageConfig> {
    let kind = required(type_flag.0, type_flag.1, type_flag.2, env)?;
    let url = optional(url_flag.0, url_flag.1, url_flag.2, env)?;
    let prefix = optional(prefix_flag.0, prefix_flag.1, prefix_flag.2, env)?.unwrap_or_default();

    let kind = match kind.as_str() {
        "mem" => StorageKind::Mem,
        "mongodb" => {
            if url.is_none() {
                return Err(KmsError::Config(format!(
                    "Neither {} (command line flag) nor {} (environment variable) have been set.",
                    url_flag.0, url_flag.1
                )));
            }
            StorageKind::MongoDb
        }
        other => {
            return Err(KmsError::Config(format!("unsupported storage type: {other}")));
        }
    };

    Ok(StorageConfig { kind, url, prefix })
}

fn read_ca_certs(paths: &str) -> Result<Vec<Vec<u8>>> {
    paths
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|path| {
            std::fs::read(path)
                .map_err(|e| KmsError::Config(format!("failed to read cert: {path}: {e}")))
        })
        .collect()
}

fn check_readable(flag: &str, path: &str) -> Result<PathBuf> {
    std::fs::metadata(path)
        .map_err(|e| KmsError::Config(format!("failed to read {flag}: {path}: {e}")))?;
    Ok(PathBuf::from(path))
}

// =============================================================================
// StartupConfig
// =============================================================================

impl StartupConfig {
    /// Resolve `args` against `env`, validating in option order.
    pub fn from_sources(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = &env;

        let host_url = required("host-url", "KMS_HOST_URL", args.host_url, env)?;
        let base_url = optional("base-url", "KMS_BASE_URL", args.base_url, env)?
            .unwrap_or_else(|| format!("http://{host_url}"));

        let (log_level, rejected_log_level) =
            match optional("log-level", "KMS_LOG_LEVEL", args.log_level, env)? {
                Some(value) => match LogLevel::parse(&value) {
                    Some(level) => (level, None),
                    None => (LogLevel::Info, Some(value)),
                },
                None => (LogLevel::Info, None),
            };

        let keystore_storage = storage(
            ("database-type", "KMS_DATABASE_TYPE", args.database_type),
            ("database-url", "KMS_DATABASE_URL", args.database_url),
            ("database-prefix", "KMS_DATABASE_PREFIX", args.database_prefix),
            env,
        )?;

        let user_keys_storage = storage(
            (
                "user-keys-storage-type",
                "KMS_USER_KEYS_STORAGE_TYPE",
                args.user_keys_storage_type,
            ),
            (
                "user-keys-storage-url",
                "KMS_USER_KEYS_STORAGE_URL",
                args.user_keys_storage_url,
            ),
            (
                "user-keys-storage-prefix",
                "KMS_USER_KEYS_STORAGE_PREFIX",
                args.user_keys_storage_prefix,
            ),
            env,
        )?;

        let ca_certs = match optional("tls-cacerts", "KMS_TLS_CACERTS", args.tls_cacerts, env)? {
            Some(paths) => read_ca_certs(&paths)?,
            None => Vec::new(),
        };
        let use_system_pool = optional(
            "tls-systemcertpool",
            "KMS_TLS_SYSTEMCERTPOOL",
            args.tls_systemcertpool,
            env,
        )?
        .map(|v| parse_bool("tls-systemcertpool", &v))
        .transpose()?
        .unwrap_or(false);

        let serve_cert = optional(
            "tls-serve-cert-path",
            "KMS_TLS_SERVE_CERT",
            args.tls_serve_cert_path,
            env,
        )?;
        let serve_key = optional(
            "tls-serve-key-path",
            "KMS_TLS_SERVE_KEY",
            args.tls_serve_key_path,
            env,
        )?;
        let tls_serve = match (serve_cert, serve_key) {
            (Some(cert), Some(key)) => Some((
                check_readable("tls-serve-cert-path", &cert)?,
                check_readable("tls-serve-key-path", &key)?,
            )),
            (None, None) => None,
            _ => {
                return Err(KmsError::Config(
                    "tls-serve-cert-path and tls-serve-key-path must be set together".into(),
                ));
            }
        };

        let master_key = optional(
            "secret-lock-key-path",
            "KMS_SECRET_LOCK_KEY_PATH",
            args.secret_lock_key_path,
            env,
        )?
        .map(|path| MasterKey::from_file(&path).map(Arc::new))
        .transpose()?;

        let hub_auth_url = optional("hub-auth-url", "KMS_HUB_AUTH_URL", args.hub_auth_url, env)?;

        let enable_cors = optional("enable-cors", "KMS_CORS_ENABLE", args.enable_cors, env)?
            .map(|v| parse_bool("enable-cors", &v))
            .transpose()?
            .unwrap_or(false);

        let cache_expiration = match optional(
            "cache-expiration",
            "KMS_CACHE_EXPIRATION",
            args.cache_expiration,
            env,
        )? {
            Some(value) => parse_duration(&value).ok_or_else(|| {
                KmsError::Config(format!("cache-expiration: invalid duration \"{value}\""))
            })?,
            None => DEFAULT_CACHE_EXPIRATION,
        };

        let did_domain = optional("did-domain", "KMS_DID_DOMAIN", args.did_domain, env)?;

        let sync_timeout = optional("sync-timeout", "KMS_SYNC_TIMEOUT", args.sync_timeout, env)?
            .map(|v| parse_number::<u64>("sync-timeout", &v))
            .transpose()?
            .unwrap_or(DEFAULT_SYNC_TIMEOUT_SECS);

        let jwt_secret = optional("jwt-secret", "KMS_JWT_SECRET", args.jwt_secret, env)?;

        let request_timeout_ms = optional(
            "request-timeout-ms",
            "KMS_REQUEST_TIMEOUT_MS",
            args.request_timeout_ms,
            env,
        )?
        .map(|v| parse_number::<u64>("request-timeout-ms", &v))
        .transpose()?
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);

        let capability_expiry_secs = optional(
            "capability-expiry-secs",
            "KMS_CAPABILITY_EXPIRY_SECS",
            args.capability_expiry_secs,
            env,
        )?
        .map(|v| parse_number::<i64>("capability-expiry-secs", &v))
        .transpose()?
        .unwrap_or(DEFAULT_CAPABILITY_EXPIRY_SECS);

        if capability_expiry_secs <= 0 {
            return Err(KmsError::Config(
                "capability-expiry-secs must be positive".into(),
            ));
        }

        Ok(Self {
            host_url,
            base_url: base_url.trim_end_matches('/').to_string(),
            log_level,
            rejected_log_level,
            keystore_storage,
            user_keys_storage,
            tls: TlsTrust {
                ca_certs,
                use_system_pool,
            },
            tls_serve,
            master_key,
            hub_auth_url,
            enable_cors,
            cache_expiration,
            did_domain,
            sync_timeout: Duration::from_secs(sync_timeout),
            jwt_secret,
            request_timeout: Duration::from_millis(request_timeout_ms),
            capability_expiry: chrono::Duration::seconds(capability_expiry_secs),
        })
    }
}
