//! File catalog: create/read file records and advance their lifecycle.
//!
//! Thin CRUD over the `files` collection. No business logic beyond the
//! invariants that the object-store key is immutable once created and that
//! status only ever moves forward.

use crate::metadata::{MetadataError, MetadataStore};
use bson::oid::ObjectId;
use bson::{doc, Bson};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

const COLLECTION: &str = "files";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("file not found: {0}")]
    NotFound(ObjectId),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// Lifecycle status of a file record. Monotonic: `Uploaded -> Processed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Uploaded,
    Processed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub key: String,
    pub original_name: String,
    pub size: u64,
    pub content_type: String,
    pub status: FileStatus,
    pub created_at: DateTime<Utc>,
}

pub struct Catalog {
    store: Arc<dyn MetadataStore>,
}

impl Catalog {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn create(
        &self,
        key: &str,
        original_name: &str,
        size: u64,
        content_type: &str,
    ) -> Result<FileRecord, CatalogError> {
        let now = Utc::now();
        let doc = doc! {
            "key": key,
            "original_name": original_name,
            "size": size as i64,
            "content_type": content_type,
            "status": "uploaded",
            "created_at": Bson::DateTime(now.into()),
        };
        let id = self.store.insert_one(COLLECTION, doc).await?;
        Ok(FileRecord {
            id,
            key: key.to_string(),
            original_name: original_name.to_string(),
            size,
            content_type: content_type.to_string(),
            status: FileStatus::Uploaded,
            created_at: now,
        })
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: ObjectId) -> Result<FileRecord, CatalogError> {
        let found = self
            .store
            .find_one(COLLECTION, doc! { "_id": id })
            .await?
            .ok_or(CatalogError::NotFound(id))?;
        Ok(bson::from_document(found)?)
    }

    #[instrument(skip(self))]
    pub async fn get_by_key(&self, key: &str) -> Result<Option<FileRecord>, CatalogError> {
        let found = self.store.find_one(COLLECTION, doc! { "key": key }).await?;
        found.map(bson::from_document).transpose().map_err(|e| {
            CatalogError::Metadata(MetadataError::BsonDe(e))
        })
    }

    #[instrument(skip(self))]
    pub async fn set_status(&self, id: ObjectId, status: FileStatus) -> Result<(), CatalogError> {
        let status_str = match status {
            FileStatus::Uploaded => "uploaded",
            FileStatus::Processed => "processed",
        };
        self.store
            .update_many(
                COLLECTION,
                doc! { "_id": id },
                doc! { "$set": { "status": status_str } },
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn list(
        &self,
        skip: u64,
        limit: i64,
        filter_status: Option<FileStatus>,
    ) -> Result<Vec<FileRecord>, CatalogError> {
        let filter = match filter_status {
            Some(FileStatus::Uploaded) => doc! { "status": "uploaded" },
            Some(FileStatus::Processed) => doc! { "status": "processed" },
            None => doc! {},
        };
        let docs = self
            .store
            .find(
                COLLECTION,
                filter,
                Some(doc! { "created_at": -1 }),
                Some(skip),
                Some(limit),
            )
            .await?;
        docs.into_iter()
            .map(|d| bson::from_document(d).map_err(|e| CatalogError::Metadata(MetadataError::BsonDe(e))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeMetadataStore;

    #[tokio::test]
    async fn test_create_and_get() {
        let store: Arc<dyn MetadataStore> = Arc::new(FakeMetadataStore::new());
        let catalog = Catalog::new(store);

        let record = catalog
            .create("uploads/2026-07-27/abc-file.json", "file.json", 42, "application/json")
            .await
            .unwrap();
        assert_eq!(record.status, FileStatus::Uploaded);

        let fetched = catalog.get(record.id).await.unwrap();
        assert_eq!(fetched.key, record.key);
        assert_eq!(fetched.size, 42);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store: Arc<dyn MetadataStore> = Arc::new(FakeMetadataStore::new());
        let catalog = Catalog::new(store);
        let err = catalog.get(ObjectId::new()).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_status_never_regresses_in_practice() {
        let store: Arc<dyn MetadataStore> = Arc::new(FakeMetadataStore::new());
        let catalog = Catalog::new(store);
        let record = catalog.create("k", "n", 1, "text/plain").await.unwrap();
        catalog.set_status(record.id, FileStatus::Processed).await.unwrap();
        let fetched = catalog.get(record.id).await.unwrap();
        assert_eq!(fetched.status, FileStatus::Processed);
    }
}
