//! KMS REST server

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kms::{
    auth::{BearerAuth, JwtValidator},
    capability::CapabilityIssuer,
    config::{Args, StartupConfig, StorageConfig, StorageKind},
    db::{
        mongo::DEFAULT_DB_NAME, CapabilityStore, KeystoreStore, MemoryCapabilityStore,
        MemoryKeystoreStore, MemoryShareStore, MongoCapabilityStore, MongoClient,
        MongoKeystoreStore, MongoShareStore, ShareStore,
    },
    dispatcher::KmsService,
    keystore::{KeystoreCache, KeystoreCacheConfig, KeystoreRegistry},
    remote::{
        build_http_client, HttpVaultClient, LocalShareSource, RemoteAuthShareSource,
        ServerShareSource,
    },
    server::{self, AppState},
};

/// Lifetime of tokens minted by the validator. Only verification is used here.
const JWT_EXPIRY_SECONDS: u64 = 3600;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    let config = match StartupConfig::from_sources(args, |key| std::env::var(key).ok()) {
        Ok(config) => config,
        Err(e) => {
            tracing_subscriber::fmt().init();
            error!("{}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("kms={},info", config.log_level.as_filter()).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(level) = &config.rejected_log_level {
        warn!("Unrecognised log level \"{}\", using info", level);
    }

    info!("======================================");
    info!("  KMS REST");
    info!("======================================");
    info!("Listen: {}", config.host_url);
    info!("Base URL: {}", config.base_url);
    info!("Keystore storage: {:?}", config.keystore_storage.kind);
    info!("User keys storage: {:?}", config.user_keys_storage.kind);
    info!(
        "Server shares: {}",
        config.hub_auth_url.as_deref().unwrap_or("local")
    );
    info!("Cache expiration: {:?}", config.cache_expiration);
    if let Some(domain) = &config.did_domain {
        info!("DID domain: {}", domain);
    }
    info!("======================================");

    if config.tls_serve.is_some() {
        warn!("TLS serving paths are set; terminate TLS in front of this process");
    }

    let keystore_store: Arc<dyn KeystoreStore> = match config.keystore_storage.kind {
        StorageKind::Mem => Arc::new(MemoryKeystoreStore::new()),
        StorageKind::MongoDb => {
            let client = connect(&config.keystore_storage).await?;
            Arc::new(MongoKeystoreStore::new(&client).await?)
        }
    };

    let (capability_store, share_store): (Arc<dyn CapabilityStore>, Arc<dyn ShareStore>) =
        match config.user_keys_storage.kind {
            StorageKind::Mem => (
                Arc::new(MemoryCapabilityStore::new()),
                Arc::new(MemoryShareStore::new()),
            ),
            StorageKind::MongoDb => {
                let client = connect(&config.user_keys_storage).await?;
                (
                    Arc::new(MongoCapabilityStore::new(&client).await?),
                    Arc::new(MongoShareStore::new(&client).await?),
                )
            }
        };

    let issuer = Arc::new(match &config.master_key {
        Some(master) => {
            CapabilityIssuer::from_master(master, capability_store, config.capability_expiry)?
        }
        None => CapabilityIssuer::ephemeral(capability_store, config.capability_expiry),
    });

    let cache = KeystoreCache::new(KeystoreCacheConfig {
        ttl: config.cache_expiration,
        ..Default::default()
    });
    let registry = Arc::new(KeystoreRegistry::new(
        keystore_store,
        Arc::clone(&issuer),
        cache,
    ));
    registry.spawn_cache_cleanup(config.cache_expiration.max(Duration::from_secs(1)));

    let http_client = build_http_client(&config.tls, config.sync_timeout)?;

    let shares: Arc<dyn ServerShareSource> = match &config.hub_auth_url {
        Some(url) => Arc::new(RemoteAuthShareSource::new(url, http_client.clone())),
        None => Arc::new(LocalShareSource::new(share_store, config.master_key.clone())),
    };

    let vault = Arc::new(HttpVaultClient::new(http_client));

    let auth = match &config.jwt_secret {
        Some(secret) => BearerAuth::Jwt(JwtValidator::new(secret.clone(), JWT_EXPIRY_SECONDS)?),
        None => {
            warn!("No JWT secret configured; bearer tokens are used as principal IDs");
            BearerAuth::Opaque
        }
    };

    let service = Arc::new(KmsService::new(registry, issuer, shares, vault));
    let state = Arc::new(AppState {
        service,
        auth,
        base_url: config.base_url.clone(),
        enable_cors: config.enable_cors,
        request_timeout: config.request_timeout,
    });

    if let Err(e) = server::run(state, &config.host_url).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn connect(storage: &StorageConfig) -> anyhow::Result<MongoClient> {
    let url = storage
        .url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("mongodb storage requires a url"))?;
    Ok(MongoClient::new(url, DEFAULT_DB_NAME, &storage.prefix).await?)
}
