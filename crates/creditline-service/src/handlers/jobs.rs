//! Generation job handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use creditline_core::{BatchId, EnhancementMode, GenerationJob, JobId, JobPayload};

use super::Pagination;
use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Create a job. Credits are held before this returns; the job runs in the
/// background.
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(payload): Json<JobPayload>,
) -> Result<(StatusCode, Json<GenerationJob>), ApiError> {
    let job = state.jobs.create_job(&auth.account_id, payload).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// Batch request.
#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    /// Images to enhance.
    pub image_urls: Vec<String>,
    /// Retouching style for every image.
    pub mode: EnhancementMode,
    /// Pro model add-on.
    #[serde(default)]
    pub pro_mode: bool,
}

/// Batch response.
#[derive(Debug, Serialize)]
pub struct BatchResponse {
    /// Shared batch id.
    pub batch_id: Option<BatchId>,
    /// Credits held for the whole batch.
    pub total_cost: i64,
    /// One job per image.
    pub jobs: Vec<GenerationJob>,
}

/// Create a batch of skin enhancements under one charge.
pub async fn create_batch(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<BatchRequest>,
) -> Result<(StatusCode, Json<BatchResponse>), ApiError> {
    let jobs = state
        .jobs
        .create_batch(&auth.account_id, body.image_urls, body.mode, body.pro_mode)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(BatchResponse {
            batch_id: jobs.first().and_then(|j| j.batch_id),
            total_cost: jobs.iter().map(|j| j.credit_cost).sum(),
            jobs,
        }),
    ))
}

/// Job list response.
#[derive(Debug, Serialize)]
pub struct JobsResponse {
    /// Jobs, newest first.
    pub jobs: Vec<GenerationJob>,
    /// Whether there are more jobs.
    pub has_more: bool,
}

/// List the caller's jobs.
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<Pagination>,
) -> Result<Json<JobsResponse>, ApiError> {
    let rows = state
        .store
        .list_jobs(&auth.account_id, query.limit() + 1, query.offset)
        .await?;
    let (jobs, has_more) = query.page(rows);
    Ok(Json(JobsResponse { jobs, has_more }))
}

/// Get one of the caller's jobs.
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<GenerationJob>, ApiError> {
    let id: JobId = id
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid job id: {e}")))?;

    state
        .store
        .get_job(&id)
        .await?
        .filter(|job| job.account_id == auth.account_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Job not found".into()))
}
