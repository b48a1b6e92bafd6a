//! Crypto operation dispatcher

pub mod service;

pub use service::{CreatedKeystore, Invocation, KmsService};
