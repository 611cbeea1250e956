//! Local-disk object store, for development and tests without a real S3
//! endpoint. Streams are written to a temp file then renamed into place so a
//! reader never observes a partially-written object.

use super::traits::{BodyStream, ObjectStore, PutResult, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

pub struct FilesystemObjectStore {
    root: PathBuf,
}

impl FilesystemObjectStore {
    pub async fn new(root: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        if !is_safe_key(key) {
            return Err(StorageError::Other(format!("unsafe object key: {key}")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    #[instrument(skip(self, body))]
    async fn put_stream(
        &self,
        key: &str,
        mut body: BodyStream,
        _content_type: &str,
    ) -> Result<PutResult, StorageError> {
        let final_path = self.object_path(key)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = final_path.with_extension("part");
        let mut file = fs::File::create(&tmp_path).await?;
        let mut total: u64 = 0;

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        fs::rename(&tmp_path, &final_path).await?;
        debug!("filesystem PUT {} ({} bytes)", key, total);

        Ok(PutResult {
            key: key.to_string(),
            size: total,
        })
    }

    #[instrument(skip(self))]
    async fn get_stream(
        &self,
        key: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, StorageError>>, StorageError> {
        let path = self.object_path(key)?;
        let data = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;
        debug!("filesystem GET {} ({} bytes)", key, data.len());
        Ok(Box::pin(stream::once(async move { Ok(Bytes::from(data)) })))
    }

    fn key_gen(&self, original_name: &str) -> String {
        crate::ingest::key_gen(original_name)
    }

    #[instrument(skip(self))]
    async fn probe(&self) -> bool {
        fs::metadata(&self.root).await.is_ok()
    }
}

/// Normalize a storage key so it can't escape the configured root via `..`
/// or an absolute path component.
pub fn is_safe_key(key: &str) -> bool {
    Path::new(key)
        .components()
        .all(|c| matches!(c, std::path::Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path().to_path_buf())
            .await
            .unwrap();

        let body: BodyStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ]));
        let result = store
            .put_stream("uploads/test.txt", body, "text/plain")
            .await
            .unwrap();
        assert_eq!(result.size, 11);

        let mut stream = store.get_stream("uploads/test.txt").await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hello world");
    }

    #[tokio::test]
    async fn test_get_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path().to_path_buf())
            .await
            .unwrap();
        let err = store.get_stream("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn test_is_safe_key_rejects_traversal() {
        assert!(!is_safe_key("../escape"));
        assert!(!is_safe_key("/etc/passwd"));
        assert!(is_safe_key("uploads/2026-07-27/file.json"));
    }

    #[tokio::test]
    async fn test_put_stream_rejects_traversal_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path().to_path_buf())
            .await
            .unwrap();
        let body: BodyStream = Box::pin(stream::iter(vec![Ok(Bytes::from_static(b"x"))]));
        let err = store.put_stream("../escape.txt", body, "text/plain").await.unwrap_err();
        assert!(matches!(err, StorageError::Other(_)));
    }

    #[tokio::test]
    async fn test_get_stream_rejects_traversal_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path().to_path_buf())
            .await
            .unwrap();
        let err = store.get_stream("../escape.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::Other(_)));
    }
}
