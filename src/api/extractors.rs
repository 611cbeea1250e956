//! Custom Axum extractors for API request validation.
//!
//! Identifiers in this service are Mongo `ObjectId`s threaded through path
//! segments as 24-hex-character strings. Validating the shape here, at the
//! extractor layer, keeps handlers from having to special-case a malformed
//! id before they even reach the catalog or job queue.

use super::errors::ApiError;
use axum::{
    async_trait,
    extract::{FromRequestParts, Path},
    http::request::Parts,
};
use bson::oid::ObjectId;

/// A path segment already parsed and validated as a Mongo `ObjectId`.
///
/// # Example
/// ```ignore
/// async fn get_job(
///     State(state): State<Arc<AppState>>,
///     ObjectIdPath(job_id): ObjectIdPath,
/// ) -> Result<Json<JobView>, ApiError> {
///     // job_id is guaranteed to be a well-formed ObjectId here
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ObjectIdPath(pub ObjectId);

#[async_trait]
impl<S> FromRequestParts<S> for ObjectIdPath
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(raw): Path<String> = Path::from_request_parts(parts, state)
            .await
            .map_err(|_| ApiError::BadRequest("missing path parameter".to_string()))?;

        let id = raw
            .parse::<ObjectId>()
            .map_err(|_| ApiError::BadRequest("Invalid fileId format".to_string()))?;

        Ok(ObjectIdPath(id))
    }
}
