//! KMS - multi-tenant key management service
//!
//! Keys are generated server-side, wrapped under a per-keystore ephemeral
//! key and only ever stored wrapped. The ephemeral key is rebuilt for each
//! request from two halves of a split secret: one presented by the client,
//! one held by the server (locally or in a remote auth service).
//!
//! ## Components
//!
//! - **Secret lock**: 2-of-2 share combination and key derivation
//! - **Keystore registry**: versioned keystore records with compare-and-swap
//! - **Capabilities**: signed, delegable authorization chains
//! - **Dispatcher**: key operations behind authorization and unlock
//! - **Remote**: auth service and vault clients
//! - **Worker**: bounded concurrency for load generation

pub mod auth;
pub mod capability;
pub mod config;
pub mod crypto;
pub mod db;
pub mod dispatcher;
pub mod keystore;
pub mod remote;
pub mod routes;
pub mod secret_lock;
pub mod server;
pub mod types;
pub mod worker;

pub use config::{Args, StartupConfig};
pub use dispatcher::KmsService;
pub use server::{run, AppState};
pub use types::{KmsError, Result};
