//! Keystore document schema
//!
//! One document per keystore with its keys embedded, so a key write and the
//! version bump are a single-document update.

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::keystore::KeystoreRecord;

/// Collection name for keystores (before prefixing)
pub const KEYSTORE_COLLECTION: &str = "keystores";

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct KeystoreDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub keystore_id: String,

    /// Mirror of `record.version` used as the compare-and-swap guard
    pub version: i64,

    pub record: KeystoreRecord,
}

impl KeystoreDoc {
    pub fn new(record: KeystoreRecord) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            keystore_id: record.id.clone(),
            version: record.version as i64,
            record,
        }
    }
}

impl IntoIndexes for KeystoreDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "keystore_id": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("keystore_id_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for KeystoreDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
