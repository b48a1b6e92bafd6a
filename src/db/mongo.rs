//! MongoDB client, typed collection wrapper and store implementations

use async_trait::async_trait;
use bson::{doc, DateTime, Document};
use mongodb::{
    options::{IndexOptions, UpdateModifications},
    results::UpdateResult,
    Client, Collection, IndexModel,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use super::schemas::{
    CapabilityDoc, KeystoreDoc, Metadata, SecretDoc, CAPABILITY_COLLECTION, KEYSTORE_COLLECTION,
    SECRET_COLLECTION,
};
use super::{CapabilityStore, KeystoreStore, ShareStore};
use crate::capability::Capability;
use crate::keystore::KeystoreRecord;
use crate::secret_lock::SealedShare;
use crate::types::{KmsError, Result};

/// Database holding every KMS collection
pub const DEFAULT_DB_NAME: &str = "kms";

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// Trait for schemas with mutable metadata
pub trait MutMetadata {
    fn mut_metadata(&mut self) -> &mut Metadata;
}

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
    prefix: String,
}

impl MongoClient {
    /// Connect and ping. Collection names are prefixed with `prefix`.
    pub async fn new(uri: &str, db_name: &str, prefix: &str) -> Result<Self> {
        info!("Connecting to MongoDB database '{}'", db_name);

        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}/?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri.trim_end_matches('/'))
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| KmsError::Storage(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| KmsError::Storage(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
            prefix: prefix.to_string(),
        })
    }

    /// Get a typed collection, creating its indexes
    pub async fn collection<T>(&self, name: &str) -> Result<MongoCollection<T>>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes + MutMetadata,
    {
        let full_name = format!("{}{}", self.prefix, name);
        MongoCollection::new(&self.client, &self.db_name, &full_name).await
    }
}

/// Typed MongoDB collection with automatic indexing
#[derive(Debug, Clone)]
pub struct MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync,
{
    inner: Collection<T>,
}

impl<T> MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync + IntoIndexes + MutMetadata,
{
    pub async fn new(client: &Client, db_name: &str, collection_name: &str) -> Result<Self> {
        let collection = client.database(db_name).collection::<T>(collection_name);
        let mongo_collection = MongoCollection { inner: collection };

        mongo_collection.apply_indexes().await?;

        Ok(mongo_collection)
    }

    async fn apply_indexes(&self) -> Result<()> {
        let schema_indices = T::into_indices();

        if schema_indices.is_empty() {
            return Ok(());
        }

        let indices: Vec<IndexModel> = schema_indices
            .into_iter()
            .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
            .collect();

        self.inner
            .create_indexes(indices)
            .await
            .map_err(|e| KmsError::Storage(format!("Failed to create indexes: {}", e)))?;

        Ok(())
    }

    /// Insert a document, setting metadata timestamps
    pub async fn insert_one(&self, mut item: T) -> Result<()> {
        let metadata = item.mut_metadata();
        metadata.created_at = Some(DateTime::now());
        metadata.updated_at = Some(DateTime::now());

        self.inner
            .insert_one(item)
            .await
            .map_err(|e| KmsError::Storage(format!("Insert failed: {}", e)))?;
        Ok(())
    }

    pub async fn find_one(&self, filter: Document) -> Result<Option<T>> {
        self.inner
            .find_one(filter)
            .await
            .map_err(|e| KmsError::Storage(format!("Find failed: {}", e)))
    }

    pub async fn update_one(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
        upsert: bool,
    ) -> Result<UpdateResult> {
        self.inner
            .update_one(filter, update.into())
            .upsert(upsert)
            .await
            .map_err(|e| KmsError::Storage(format!("Update failed: {}", e)))
    }
}

// =============================================================================
// Store implementations
// =============================================================================

pub struct MongoKeystoreStore {
    keystores: MongoCollection<KeystoreDoc>,
}

impl MongoKeystoreStore {
    pub async fn new(client: &MongoClient) -> Result<Self> {
        Ok(Self {
            keystores: client.collection(KEYSTORE_COLLECTION).await?,
        })
    }
}

#[async_trait]
impl KeystoreStore for MongoKeystoreStore {
    async fn insert(&self, record: &KeystoreRecord) -> Result<()> {
        self.keystores.insert_one(KeystoreDoc::new(record.clone())).await
    }

    async fn get(&self, id: &str) -> Result<Option<KeystoreRecord>> {
        Ok(self
            .keystores
            .find_one(doc! { "keystore_id": id })
            .await?
            .map(|d| d.record))
    }

    async fn compare_and_swap(&self, record: &KeystoreRecord, expected_version: u64) -> Result<()> {
        let filter = doc! {
            "keystore_id": record.id.as_str(),
            "version": expected_version as i64,
        };
        let update = doc! {
            "$set": {
                "version": record.version as i64,
                "record": bson::to_bson(record)?,
                "metadata.updated_at": DateTime::now(),
            }
        };

        let result = self.keystores.update_one(filter, update, false).await?;
        if result.matched_count == 1 {
            return Ok(());
        }

        let current = self
            .keystores
            .find_one(doc! { "keystore_id": record.id.as_str() })
            .await?
            .ok_or_else(|| KmsError::NotFound(record.id.clone()))?;

        debug!(
            keystore_id = %record.id,
            expected = expected_version,
            actual = current.version,
            "compare-and-swap lost"
        );

        Err(KmsError::VersionConflict {
            keystore_id: record.id.clone(),
            expected: expected_version,
            actual: current.version as u64,
        })
    }
}

pub struct MongoCapabilityStore {
    capabilities: MongoCollection<CapabilityDoc>,
}

impl MongoCapabilityStore {
    pub async fn new(client: &MongoClient) -> Result<Self> {
        Ok(Self {
            capabilities: client.collection(CAPABILITY_COLLECTION).await?,
        })
    }
}

#[async_trait]
impl CapabilityStore for MongoCapabilityStore {
    async fn put(&self, capability: &Capability) -> Result<()> {
        self.capabilities
            .insert_one(CapabilityDoc::new(capability.clone()))
            .await
    }

    async fn get(&self, id: &str) -> Result<Option<Capability>> {
        Ok(self
            .capabilities
            .find_one(doc! { "capability_id": id })
            .await?
            .map(|d| d.capability))
    }
}

pub struct MongoShareStore {
    secrets: MongoCollection<SecretDoc>,
}

impl MongoShareStore {
    pub async fn new(client: &MongoClient) -> Result<Self> {
        Ok(Self {
            secrets: client.collection(SECRET_COLLECTION).await?,
        })
    }
}

#[async_trait]
impl ShareStore for MongoShareStore {
    async fn put(&self, owner: &str, share: &SealedShare) -> Result<()> {
        let doc = SecretDoc {
            _id: None,
            metadata: Metadata::new(),
            owner: owner.to_string(),
            nonce: share.nonce.clone(),
            ciphertext: share.ciphertext.clone(),
        };
        let update = doc! { "$set": bson::to_document(&doc)? };
        self.secrets
            .update_one(doc! { "owner": owner }, update, true)
            .await?;
        Ok(())
    }

    async fn get(&self, owner: &str) -> Result<Option<SealedShare>> {
        Ok(self
            .secrets
            .find_one(doc! { "owner": owner })
            .await?
            .map(|d| SealedShare {
                nonce: d.nonce,
                ciphertext: d.ciphertext,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keystore_doc_mirrors_version() {
        let mut record =
            KeystoreRecord::new("ks-1".into(), "did:example:1".into(), "owner".into(), "cap".into());
        record.version = 7;

        let doc = KeystoreDoc::new(record);
        assert_eq!(doc.keystore_id, "ks-1");
        assert_eq!(doc.version, 7);

        let bson_doc = bson::to_document(&doc).unwrap();
        assert_eq!(bson_doc.get_i64("version").unwrap(), 7);
        assert!(bson_doc.get_document("record").is_ok());
    }

    #[test]
    fn test_index_definitions() {
        assert_eq!(KeystoreDoc::into_indices().len(), 1);
        assert_eq!(SecretDoc::into_indices().len(), 1);
        assert_eq!(CapabilityDoc::into_indices().len(), 2);
    }
}
