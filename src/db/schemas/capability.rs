//! Capability document schema

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for issued capabilities (before prefixing)
pub const CAPABILITY_COLLECTION: &str = "capabilities";

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CapabilityDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub capability_id: String,

    pub capability: Capability,
}

impl CapabilityDoc {
    pub fn new(capability: Capability) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            capability_id: capability.id.clone(),
            capability,
        }
    }
}

impl IntoIndexes for CapabilityDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "capability_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("capability_id_unique".to_string())
                        .build(),
                ),
            ),
            // Chain walks and audits by keystore
            (
                doc! { "capability.invocationTarget": 1 },
                Some(
                    IndexOptions::builder()
                        .name("invocation_target_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for CapabilityDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
