//! HTTP-facing error type. Every component error funnels into one
//! `ApiError` with a single status-code mapping, keeping the split between
//! an internal error enum per component and one request-facing error type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::ingest::IngestError;
use crate::jobs::JobError;
use crate::metadata::MetadataError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("upload exceeded the maximum allowed size of {max} bytes")]
    TooLarge { max: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            // Treated as an upstream/processing failure, not a client
            // request error: a truncated upload already aborted against the
            // object store, not merely rejected up front.
            ApiError::TooLarge { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ApiError::TooLarge { max } => ErrorBody {
                error: "Upload failed".to_string(),
                message: Some(format!("File size exceeds maximum allowed size of {max} bytes")),
            },
            other => ErrorBody {
                error: other.to_string(),
                message: None,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "internal error serving request");
        }
        (status, Json(self.body())).into_response()
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::NotMultipart
            | IngestError::MissingFile
            | IngestError::DisallowedContentType(_)
            | IngestError::Multipart(_) => ApiError::BadRequest(err.to_string()),
            IngestError::TooLarge { max } => ApiError::TooLarge { max },
            IngestError::Storage(e) => e.into(),
            IngestError::Catalog(e) => e.into(),
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(_) => ApiError::NotFound,
            CatalogError::Metadata(e) => e.into(),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(_) => ApiError::NotFound,
            JobError::InvalidTransition(_) => ApiError::Internal(err.to_string()),
            JobError::Metadata(e) => e.into(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) => ApiError::NotFound,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<MetadataError> for ApiError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound => ApiError::NotFound,
            other => ApiError::Internal(other.to_string()),
        }
    }
}
