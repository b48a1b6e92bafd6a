//! Server-held share document schema
//!
//! Lives in the user-keys store. Shares are sealed under the master key when
//! one is configured.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::types::base64_bytes;

/// Collection name for server-held shares (before prefixing)
pub const SECRET_COLLECTION: &str = "secrets";

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SecretDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Principal the share belongs to
    pub owner: String,

    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,

    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

impl IntoIndexes for SecretDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "owner": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("owner_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for SecretDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
