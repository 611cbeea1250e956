//! S3 object-store backend, streaming multipart upload via the AWS SDK.

use super::traits::{BodyStream, ObjectStore, PutResult, StorageError};
use crate::config::BackendConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

/// Minimum size of a non-final multipart part, per the S3 multipart protocol.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
/// Parts uploaded concurrently for a single object.
const DEFAULT_CONCURRENCY: usize = 4;

/// S3-backed object store.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Build a client from configuration, honoring a custom endpoint and
    /// explicit credentials when present (MinIO/LocalStack-style setups),
    /// otherwise falling back to the default AWS credential chain.
    pub async fn new(config: &BackendConfig) -> Result<Self, StorageError> {
        let (bucket, region, endpoint_url, access_key_id, secret_access_key) = match config {
            BackendConfig::S3 {
                bucket,
                region,
                endpoint_url,
                access_key_id,
                secret_access_key,
            } => (
                bucket.clone(),
                region.clone(),
                endpoint_url.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
            ),
            BackendConfig::Filesystem { .. } => {
                return Err(StorageError::Other(
                    "S3ObjectStore requires S3 configuration".to_string(),
                ))
            }
        };

        let mut config_loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region));

        if let Some(ref ep) = endpoint_url {
            config_loader = config_loader.endpoint_url(ep);
        }

        if let (Some(ref key_id), Some(ref secret)) = (access_key_id, secret_access_key) {
            let credentials = Credentials::new(key_id, secret, None, None, "lineloom-config");
            config_loader = config_loader.credentials_provider(credentials);
        }

        let sdk_config = config_loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();
        let client = Client::from_conf(s3_config);

        debug!("S3ObjectStore initialized for bucket: {}", bucket);
        Ok(Self { client, bucket })
    }

    async fn upload_small(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::S3(format!("put_object failed: {e}")))?;
        Ok(())
    }

    async fn upload_multipart(
        &self,
        key: &str,
        mut body: BodyStream,
        content_type: &str,
        first_part: Bytes,
    ) -> Result<u64, StorageError> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::S3(format!("create_multipart_upload failed: {e}")))?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| StorageError::S3("missing upload_id in create response".into()))?
            .to_string();

        let result = self
            .drive_multipart(key, &upload_id, &mut body, content_type, first_part)
            .await;

        match result {
            Ok(total) => Ok(total),
            Err(e) => {
                warn!("aborting multipart upload {} for {}: {}", upload_id, key, e);
                let _ = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await;
                Err(e)
            }
        }
    }

    async fn drive_multipart(
        &self,
        key: &str,
        upload_id: &str,
        body: &mut BodyStream,
        _content_type: &str,
        first_part: Bytes,
    ) -> Result<u64, StorageError> {
        let semaphore = Arc::new(Semaphore::new(DEFAULT_CONCURRENCY));
        let mut tasks: JoinSet<Result<(i32, CompletedPart), StorageError>> = JoinSet::new();
        let mut part_number = 1i32;
        let mut total: u64 = 0;
        let mut pending = first_part;

        loop {
            while pending.len() < MIN_PART_SIZE {
                match body.next().await {
                    Some(Ok(chunk)) => {
                        let mut combined = BytesMut::with_capacity(pending.len() + chunk.len());
                        combined.extend_from_slice(&pending);
                        combined.extend_from_slice(&chunk);
                        pending = combined.freeze();
                    }
                    Some(Err(e)) => return Err(StorageError::Io(e)),
                    None => break,
                }
            }

            if pending.is_empty() {
                break;
            }

            let more_remains = pending.len() >= MIN_PART_SIZE;
            let part_data = pending;
            pending = Bytes::new();

            total += part_data.len() as u64;
            let this_part = part_number;
            part_number += 1;

            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key_owned = key.to_string();
            let upload_id_owned = upload_id.to_string();
            let permit = semaphore.clone().acquire_owned().await.map_err(|e| {
                StorageError::Other(format!("semaphore closed: {e}"))
            })?;

            tasks.spawn(async move {
                let _permit = permit;
                let resp = client
                    .upload_part()
                    .bucket(bucket)
                    .key(key_owned)
                    .upload_id(upload_id_owned)
                    .part_number(this_part)
                    .body(ByteStream::from(part_data))
                    .send()
                    .await
                    .map_err(|e| StorageError::S3(format!("upload_part {this_part} failed: {e}")))?;
                let etag = resp
                    .e_tag()
                    .ok_or_else(|| StorageError::S3(format!("part {this_part} missing etag")))?
                    .to_string();
                Ok((
                    this_part,
                    CompletedPart::builder()
                        .part_number(this_part)
                        .e_tag(etag)
                        .build(),
                ))
            });

            if !more_remains {
                // Drained the upstream; nothing more to batch into a part.
                if body.next().await.is_some() {
                    return Err(StorageError::Other(
                        "unexpected trailing chunk after stream end".into(),
                    ));
                }
                break;
            }
        }

        let mut completed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let part = joined
                .map_err(|e| StorageError::Other(format!("upload task panicked: {e}")))??;
            completed.push(part);
        }
        completed.sort_by_key(|(n, _)| *n);
        let parts: Vec<CompletedPart> = completed.into_iter().map(|(_, p)| p).collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| StorageError::S3(format!("complete_multipart_upload failed: {e}")))?;

        Ok(total)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, body))]
    async fn put_stream(
        &self,
        key: &str,
        mut body: BodyStream,
        content_type: &str,
    ) -> Result<PutResult, StorageError> {
        let mut buf = BytesMut::new();
        while buf.len() < MIN_PART_SIZE {
            match body.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(StorageError::Io(e)),
                None => break,
            }
        }
        let first = buf.freeze();

        let size = if first.len() < MIN_PART_SIZE {
            self.upload_small(key, first.clone(), content_type).await?;
            first.len() as u64
        } else {
            self.upload_multipart(key, body, content_type, first).await?
        };

        debug!("S3 PUT {} ({} bytes)", key, size);
        Ok(PutResult {
            key: key.to_string(),
            size,
        })
    }

    #[instrument(skip(self))]
    async fn get_stream(
        &self,
        key: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, StorageError>>, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if let SdkError::ServiceError(service_error) = &e {
                    if matches!(
                        service_error.err(),
                        aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_)
                    ) {
                        return StorageError::NotFound(key.to_string());
                    }
                }
                StorageError::S3(format!("get_object failed: {e}"))
            })?;

        let stream = response
            .body
            .map(|res| res.map_err(|e| StorageError::S3(format!("body read error: {e}"))));
        Ok(Box::pin(stream))
    }

    fn key_gen(&self, original_name: &str) -> String {
        crate::ingest::key_gen(original_name)
    }

    #[instrument(skip(self))]
    async fn probe(&self) -> bool {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
    }
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("bucket", &self.bucket)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_part_size_meets_s3_minimum() {
        assert!(MIN_PART_SIZE >= 5 * 1024 * 1024);
    }
}
