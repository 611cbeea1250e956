//! Ingest pipeline: multipart request body -> object store -> file catalog.
//!
//! The multipart field reader and the object-store upload run concurrently;
//! bytes flow from one to the other over a bounded channel so the whole
//! file is never buffered in memory. A `tokio::sync::oneshot` guards
//! against the handler observing more than one terminal outcome, the Rust
//! replacement for a boolean "already responded" flag.

use crate::catalog::{Catalog, CatalogError, FileRecord};
use crate::storage::{ObjectStore, StorageError};
use axum::extract::Multipart;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, instrument, warn};

/// Bound on the in-flight byte-chunk channel between the multipart reader
/// and the object-store writer.
const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("request must be multipart/form-data with a single file part")]
    NotMultipart,

    #[error("no file part present in the request")]
    MissingFile,

    #[error("content type '{0}' is not allowed")]
    DisallowedContentType(String),

    #[error("upload exceeded the maximum allowed size of {max} bytes")]
    TooLarge { max: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("multipart read error: {0}")]
    Multipart(String),
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub file_id: String,
    pub key: String,
    pub message: String,
    pub metadata: FileRecord,
}

/// Derive a unique storage key: `uploads/<YYYY-MM-DD>/<epoch-millis>-<6-char-random>-<sanitized-name>`.
pub fn key_gen(original_name: &str) -> String {
    let now = Utc::now();
    let date = now.format("%Y-%m-%d");
    let millis = now.timestamp_millis();
    let suffix: String = {
        let mut rng = rand::thread_rng();
        (0..6)
            .map(|_| {
                let charset = b"abcdefghijklmnopqrstuvwxyz0123456789";
                charset[rng.gen_range(0..charset.len())] as char
            })
            .collect()
    };
    let sanitized = sanitize_filename(original_name);
    format!("uploads/{date}/{millis}-{suffix}-{sanitized}")
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// End-to-end: validate, stream to the object store, record in the catalog.
#[instrument(skip(store, catalog, multipart))]
pub async fn handle_upload(
    store: &Arc<dyn ObjectStore>,
    catalog: &Catalog,
    allowed_types: &[String],
    max_file_size: u64,
    mut multipart: Multipart,
) -> Result<UploadResponse, IngestError> {
    let mut field = multipart
        .next_field()
        .await
        .map_err(|e| IngestError::Multipart(e.to_string()))?
        .ok_or(IngestError::MissingFile)?;

    let original_name = field
        .file_name()
        .map(str::to_string)
        .unwrap_or_else(|| "upload.bin".to_string());
    let content_type = field
        .content_type()
        .map(str::to_string)
        .unwrap_or_else(|| "application/octet-stream".to_string());

    if !allowed_types.iter().any(|t| t == &content_type) {
        drain_field(field).await;
        return Err(IngestError::DisallowedContentType(content_type));
    }

    let key = store.key_gen(&original_name);

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(CHANNEL_CAPACITY);
    let (outcome_tx, outcome_rx) = oneshot::channel::<Result<u64, IngestError>>();

    let store_clone = Arc::clone(store);
    let key_clone = key.clone();
    let content_type_clone = content_type.clone();
    let max_size = max_file_size;

    tokio::spawn(async move {
        let body: crate::storage::BodyStream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        let result = store_clone
            .put_stream(&key_clone, body, &content_type_clone)
            .await
            .map(|put| put.size)
            .map_err(IngestError::from);
        let _ = outcome_tx.send(result.and_then(|size| {
            if size > max_size {
                Err(IngestError::TooLarge { max: max_size })
            } else {
                Ok(size)
            }
        }));
    });

    let mut observed: u64 = 0;
    let read_result: Result<(), IngestError> = loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                observed += chunk.len() as u64;
                if observed > max_file_size {
                    // Signal the writer with an error, not a clean close, so
                    // a multipart upload already in flight aborts instead of
                    // completing a truncated object.
                    let _ = tx
                        .send(Err(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            format!("upload exceeded the maximum allowed size of {max_file_size} bytes"),
                        )))
                        .await;
                    drop(tx);
                    break Err(IngestError::TooLarge { max: max_file_size });
                }
                if tx.send(Ok(chunk)).await.is_err() {
                    break Ok(());
                }
            }
            Ok(None) => {
                drop(tx);
                break Ok(());
            }
            Err(e) => {
                drop(tx);
                break Err(IngestError::Multipart(e.to_string()));
            }
        }
    };

    let put_outcome = outcome_rx
        .await
        .unwrap_or_else(|_| Err(IngestError::Multipart("upload task dropped".to_string())));

    read_result?;
    let size = put_outcome?;

    let record = catalog
        .create(&key, &original_name, size, &content_type)
        .await?;

    info!(file_id = %record.id, key = %key, size, "upload complete");

    Ok(UploadResponse {
        file_id: record.id.to_hex(),
        key,
        message: "uploaded".to_string(),
        metadata: record,
    })
}

async fn drain_field(mut field: axum::extract::multipart::Field<'_>) {
    while let Ok(Some(_)) = field.chunk().await {
        // Discard so the client isn't left stalled on a half-read body.
    }
}
