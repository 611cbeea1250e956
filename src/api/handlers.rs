//! HTTP handlers and shared application state.

use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::catalog::Catalog;
use crate::ingest::{self, UploadResponse};
use crate::jobs::{JobQueue, JobRecord, JobResult, JobState};
use crate::metadata::MetadataStore;
use crate::storage::ObjectStore;

use super::errors::ApiError;
use super::extractors::ObjectIdPath;

/// Shared, process-lifetime application state, built once at startup and
/// handed to every handler behind `Arc`.
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub catalog: Catalog,
    pub jobs: Arc<JobQueue>,
    pub metadata: Arc<dyn MetadataStore>,
    pub allowed_file_types: Vec<String>,
    pub max_file_size: u64,
}

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub job_id: String,
    pub file_id: String,
    pub state: &'static str,
    pub queued_at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub file_id: String,
    pub state: &'static str,
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: crate::jobs::Progress,
    pub error_count: u64,
    pub result: Option<JobResult>,
}

impl From<JobRecord> for JobView {
    fn from(record: JobRecord) -> Self {
        let (state, result) = match record.state {
            JobState::Queued => ("queued", None),
            JobState::InProgress { .. } => ("in_progress", None),
            JobState::Completed { result } => ("completed", Some(result)),
            JobState::Failed { result } => ("failed", Some(result)),
        };
        JobView {
            job_id: record.id.to_hex(),
            file_id: record.file_id.to_hex(),
            state,
            attempts: record.attempts,
            queued_at: record.queued_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            error_count: record.progress.error_count,
            progress: record.progress,
            result,
        }
    }
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let response = ingest::handle_upload(
        &state.store,
        &state.catalog,
        &state.allowed_file_types,
        state.max_file_size,
        multipart,
    )
    .await?;
    Ok(Json(response))
}

pub async fn process(
    State(state): State<Arc<AppState>>,
    ObjectIdPath(file_id): ObjectIdPath,
) -> Result<(StatusCode, Json<ProcessResponse>), ApiError> {
    // Confirms the file exists before queueing work against it.
    state.catalog.get(file_id).await?;

    let job = state.jobs.create(file_id).await?;
    let response = ProcessResponse {
        job_id: job.id.to_hex(),
        file_id: file_id.to_hex(),
        state: "queued",
        queued_at: job.queued_at,
        message: "job queued".to_string(),
    };
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    ObjectIdPath(job_id): ObjectIdPath,
) -> Result<Json<JobView>, ApiError> {
    let record = state.jobs.get(job_id).await?;
    Ok(Json(record.into()))
}

pub async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    let storage_ok = state.store.probe().await;
    let metadata_ok = state.metadata.ping().await.is_ok();

    if storage_ok && metadata_ok {
        StatusCode::OK.into_response()
    } else {
        let status = if storage_ok || metadata_ok { "degraded" } else { "unhealthy" };
        let body = Json(json!({
            "status": status,
            "services": {
                "storage": if storage_ok { "ok" } else { "unreachable" },
                "metadata": if metadata_ok { "ok" } else { "unreachable" },
            }
        }));
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "service": "lineloom",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
