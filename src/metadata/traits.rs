//! Document-store abstraction the catalog and job-queue modules are built
//! on top of. Working in raw BSON documents (rather than one bespoke method
//! per collection) keeps this trait small and lets tests swap in an
//! in-memory fake without a real MongoDB deployment.

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::Document;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("document not found")]
    NotFound,

    #[error("mongodb error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("bson serialization error: {0}")]
    Bson(#[from] bson::ser::Error),

    #[error("bson deserialization error: {0}")]
    BsonDe(#[from] bson::de::Error),

    #[error("metadata store error: {0}")]
    Other(String),
}

/// A minimal, object-safe document-store contract.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a single document, returning its generated id.
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<ObjectId, MetadataError>;

    /// Insert many documents without preserving failure ordering — one bad
    /// document doesn't block the rest from landing.
    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> Result<(), MetadataError>;

    /// Fetch the first document matching `filter`.
    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
    ) -> Result<Option<Document>, MetadataError>;

    /// Atomically find a document matching `filter`, apply `update`, and
    /// return the document as it looked *after* the update. `sort` breaks
    /// ties among multiple matches (used for FIFO job claims).
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        sort: Option<Document>,
    ) -> Result<Option<Document>, MetadataError>;

    /// Apply `update` to every document matching `filter`, returning the
    /// count of matched documents.
    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> Result<u64, MetadataError>;

    /// List documents matching `filter`, applying optional sort/skip/limit.
    async fn find(
        &self,
        collection: &str,
        filter: Document,
        sort: Option<Document>,
        skip: Option<u64>,
        limit: Option<i64>,
    ) -> Result<Vec<Document>, MetadataError>;

    /// Liveness check against the underlying store.
    async fn ping(&self) -> Result<(), MetadataError>;
}
