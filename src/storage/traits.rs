//! Object-store backend trait definition.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

/// Errors that can occur during object-store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("s3 error: {0}")]
    S3(String),

    #[error("bucket not reachable: {0}")]
    BucketUnreachable(String),

    #[error("storage error: {0}")]
    Other(String),
}

/// Result of a completed `put_stream` call.
#[derive(Debug, Clone)]
pub struct PutResult {
    /// The key the object was stored under.
    pub key: String,
    /// Total bytes observed while streaming the body.
    pub size: u64,
}

/// A chunk of bytes read from an HTTP body, the shape `put_stream` consumes.
pub type BodyStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// Abstract, content-addressed object storage backend.
///
/// Object-safe so it can be held behind `Arc<dyn ObjectStore>` in shared
/// application state.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stream `body` into the store under `key` without buffering the whole
    /// payload in memory. Returns the exact byte count observed.
    async fn put_stream(
        &self,
        key: &str,
        body: BodyStream,
        content_type: &str,
    ) -> Result<PutResult, StorageError>;

    /// Open a consumer-driven stream of the object's bytes.
    async fn get_stream(
        &self,
        key: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, StorageError>>, StorageError>;

    /// Derive a unique storage key for an uploaded file's original name.
    fn key_gen(&self, original_name: &str) -> String;

    /// Cheap reachability check against the configured bucket/directory.
    async fn probe(&self) -> bool;
}
