//! Startup configuration resolution tests

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use clap::Parser;

use kms::config::{Args, LogLevel, StartupConfig, StorageKind};
use kms::KmsError;

fn args(flags: &[&str]) -> Args {
    let mut argv = vec!["kms-rest"];
    argv.extend_from_slice(flags);
    Args::try_parse_from(argv).expect("flags parse")
}

fn resolve(flags: &[&str], env: &[(&str, &str)]) -> Result<StartupConfig, KmsError> {
    let env: HashMap<String, String> = env
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    StartupConfig::from_sources(args(flags), move |key| env.get(key).cloned())
}

fn config_error(result: Result<StartupConfig, KmsError>) -> String {
    match result {
        Err(KmsError::Config(msg)) => msg,
        Err(other) => panic!("expected config error, got {other:?}"),
        Ok(_) => panic!("expected config error, got a config"),
    }
}

const MINIMAL: &[&str] = &[
    "--host-url",
    "localhost:8076",
    "--database-type",
    "mem",
    "--user-keys-storage-type",
    "mem",
];

#[test]
fn test_missing_host_url() {
    assert_eq!(
        config_error(resolve(&[], &[])),
        "Neither host-url (command line flag) nor KMS_HOST_URL (environment variable) have been set."
    );
}

#[test]
fn test_blank_host_url_flag_and_env() {
    assert_eq!(
        config_error(resolve(&["--host-url", ""], &[])),
        "host-url value is empty"
    );
    assert_eq!(
        config_error(resolve(&[], &[("KMS_HOST_URL", "  ")])),
        "KMS_HOST_URL value is empty"
    );
}

#[test]
fn test_missing_database_type() {
    assert_eq!(
        config_error(resolve(&["--host-url", "localhost:8076"], &[])),
        "Neither database-type (command line flag) nor KMS_DATABASE_TYPE (environment variable) have been set."
    );
}

#[test]
fn test_unsupported_storage_type() {
    assert_eq!(
        config_error(resolve(
            &["--host-url", "localhost:8076", "--database-type", "couchdb"],
            &[]
        )),
        "unsupported storage type: couchdb"
    );
}

#[test]
fn test_mongodb_requires_url() {
    assert_eq!(
        config_error(resolve(
            &["--host-url", "localhost:8076", "--database-type", "mongodb"],
            &[]
        )),
        "Neither database-url (command line flag) nor KMS_DATABASE_URL (environment variable) have been set."
    );
}

#[test]
fn test_blank_user_keys_prefix_from_env() {
    assert_eq!(
        config_error(resolve(MINIMAL, &[("KMS_USER_KEYS_STORAGE_PREFIX", "")])),
        "KMS_USER_KEYS_STORAGE_PREFIX value is empty"
    );
}

#[test]
fn test_minimal_config_defaults() {
    let config = tokio_test::assert_ok!(resolve(MINIMAL, &[]));

    assert_eq!(config.host_url, "localhost:8076");
    assert_eq!(config.base_url, "http://localhost:8076");
    assert_eq!(config.log_level, LogLevel::Info);
    assert_eq!(config.keystore_storage.kind, StorageKind::Mem);
    assert_eq!(config.user_keys_storage.kind, StorageKind::Mem);
    assert!(config.tls.ca_certs.is_empty());
    assert!(!config.tls.use_system_pool);
    assert!(config.master_key.is_none());
    assert!(config.hub_auth_url.is_none());
    assert!(!config.enable_cors);
    assert_eq!(config.cache_expiration, Duration::from_secs(600));
    assert_eq!(config.sync_timeout, Duration::from_secs(3));
}

#[test]
fn test_env_fills_in_and_flag_wins() {
    let config = resolve(
        &["--host-url", "0.0.0.0:9000"],
        &[
            ("KMS_HOST_URL", "127.0.0.1:1"),
            ("KMS_DATABASE_TYPE", "mongodb"),
            ("KMS_DATABASE_URL", "mongodb://localhost:27017"),
            ("KMS_DATABASE_PREFIX", "kms_"),
            ("KMS_USER_KEYS_STORAGE_TYPE", "mem"),
            ("KMS_LOG_LEVEL", "debug"),
            ("KMS_CORS_ENABLE", "true"),
            ("KMS_CACHE_EXPIRATION", "30s"),
            ("KMS_BASE_URL", "https://kms.example.com/"),
        ],
    )
    .unwrap();

    assert_eq!(config.host_url, "0.0.0.0:9000");
    assert_eq!(config.base_url, "https://kms.example.com");
    assert_eq!(config.keystore_storage.kind, StorageKind::MongoDb);
    assert_eq!(config.keystore_storage.prefix, "kms_");
    assert_eq!(config.log_level, LogLevel::Debug);
    assert!(config.enable_cors);
    assert_eq!(config.cache_expiration, Duration::from_secs(30));
}

#[test]
fn test_unknown_log_level_falls_back_to_info() {
    let mut flags = MINIMAL.to_vec();
    flags.extend_from_slice(&["--log-level", "verbose"]);
    let config = resolve(&flags, &[]).unwrap();

    assert_eq!(config.log_level, LogLevel::Info);
    assert_eq!(config.rejected_log_level.as_deref(), Some("verbose"));
}

#[test]
fn test_invalid_values_rejected() {
    let cases: &[(&str, &str)] = &[
        ("--enable-cors", "maybe"),
        ("--tls-systemcertpool", "yes please"),
        ("--cache-expiration", "forever"),
        ("--sync-timeout", "3s"),
    ];

    for (flag, value) in cases {
        let mut flags = MINIMAL.to_vec();
        flags.extend_from_slice(&[*flag, *value]);
        assert!(
            matches!(resolve(&flags, &[]), Err(KmsError::Config(_))),
            "{flag}={value} should be rejected"
        );
    }
}

#[test]
fn test_unreadable_ca_cert() {
    let mut flags = MINIMAL.to_vec();
    flags.extend_from_slice(&["--tls-cacerts", "/test/path"]);
    let msg = config_error(resolve(&flags, &[]));
    assert!(msg.starts_with("failed to read cert: /test/path"), "{msg}");
}

#[test]
fn test_ca_certs_loaded() {
    let mut cert = tempfile::NamedTempFile::new().unwrap();
    cert.write_all(b"-----BEGIN CERTIFICATE-----\n").unwrap();
    let path = cert.path().to_str().unwrap().to_string();

    let mut flags = MINIMAL.to_vec();
    flags.extend_from_slice(&["--tls-cacerts", path.as_str(), "--tls-systemcertpool", "true"]);
    let config = resolve(&flags, &[]).unwrap();

    assert_eq!(config.tls.ca_certs.len(), 1);
    assert!(config.tls.use_system_pool);
}

#[test]
fn test_tls_serve_paths_must_pair() {
    let cert = tempfile::NamedTempFile::new().unwrap();
    let path = cert.path().to_str().unwrap().to_string();

    let mut flags = MINIMAL.to_vec();
    flags.extend_from_slice(&["--tls-serve-cert-path", path.as_str()]);
    assert!(matches!(resolve(&flags, &[]), Err(KmsError::Config(_))));
}

#[test]
fn test_secret_lock_key_file() {
    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    writeln!(key_file, "{}", "A".repeat(43) + "=").unwrap();
    let path = key_file.path().to_str().unwrap().to_string();

    let mut flags = MINIMAL.to_vec();
    flags.extend_from_slice(&["--secret-lock-key-path", path.as_str()]);
    let config = tokio_test::assert_ok!(resolve(&flags, &[]));
    assert!(config.master_key.is_some());
}

#[test]
fn test_secret_lock_key_file_rejected() {
    let empty = tempfile::NamedTempFile::new().unwrap();
    let mut short = tempfile::NamedTempFile::new().unwrap();
    write!(short, "c2hvcnQ=").unwrap();

    for file in [&empty, &short] {
        let path = file.path().to_str().unwrap().to_string();
        let mut flags = MINIMAL.to_vec();
        flags.extend_from_slice(&["--secret-lock-key-path", path.as_str()]);
        assert!(matches!(resolve(&flags, &[]), Err(KmsError::Config(_))));
    }

    let mut flags = MINIMAL.to_vec();
    flags.extend_from_slice(&["--secret-lock-key-path", "/no/such/key"]);
    assert!(matches!(resolve(&flags, &[]), Err(KmsError::Config(_))));
}
