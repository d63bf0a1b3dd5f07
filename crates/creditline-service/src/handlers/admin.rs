//! Admin handlers.
//!
//! Every route here requires the `X-Admin-Key` header and logs the acting
//! admin.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use creditline_core::{AccountId, GenerationJob, JobId, LedgerEntry};

use crate::auth::AdminAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Manual credit adjustment.
#[derive(Debug, Deserialize)]
pub struct AdjustCreditsRequest {
    /// Target account.
    pub account_id: AccountId,
    /// Positive amount.
    pub amount: i64,
    /// Ledger reason.
    pub reason: String,
}

/// Adjustment result.
#[derive(Debug, Serialize)]
pub struct AdjustCreditsResponse {
    /// The entry written.
    pub entry: LedgerEntry,
    /// Balance after the change.
    pub balance: i64,
}

impl From<LedgerEntry> for AdjustCreditsResponse {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            balance: entry.balance_after,
            entry,
        }
    }
}

/// Grant credits.
pub async fn add_credits(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Json(req): Json<AdjustCreditsRequest>,
) -> Result<Json<AdjustCreditsResponse>, ApiError> {
    tracing::info!(
        admin_id = %admin.admin_id,
        account_id = %req.account_id,
        amount = req.amount,
        "Admin credit grant"
    );
    let entry = state.credits.add(&req.account_id, req.amount, &req.reason).await?;
    Ok(Json(entry.into()))
}

/// Remove credits. Fails with 402 if the balance is too low.
pub async fn deduct_credits(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Json(req): Json<AdjustCreditsRequest>,
) -> Result<Json<AdjustCreditsResponse>, ApiError> {
    tracing::info!(
        admin_id = %admin.admin_id,
        account_id = %req.account_id,
        amount = req.amount,
        "Admin credit deduction"
    );
    let entry = state
        .credits
        .deduct(&req.account_id, req.amount, &req.reason)
        .await?;
    Ok(Json(entry.into()))
}

/// Refund credits.
pub async fn refund_credits(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Json(req): Json<AdjustCreditsRequest>,
) -> Result<Json<AdjustCreditsResponse>, ApiError> {
    tracing::info!(
        admin_id = %admin.admin_id,
        account_id = %req.account_id,
        amount = req.amount,
        "Admin credit refund"
    );
    let entry = state
        .credits
        .refund(&req.account_id, req.amount, &req.reason)
        .await?;
    Ok(Json(entry.into()))
}

/// Cancel request.
#[derive(Debug, Default, Deserialize)]
pub struct CancelJobRequest {
    /// Reason recorded on the job.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Cancel an in-flight job without moving credits.
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Path(id): Path<String>,
    body: Option<Json<CancelJobRequest>>,
) -> Result<Json<GenerationJob>, ApiError> {
    let id: JobId = id
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid job id: {e}")))?;
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| format!("cancelled by {}", admin.admin_id));

    Ok(Json(state.jobs.cancel(&id, &reason).await?))
}

/// Setting update.
#[derive(Debug, Deserialize)]
pub struct PutSettingRequest {
    /// New value.
    pub value: String,
}

/// Stored setting.
#[derive(Debug, Serialize)]
pub struct SettingResponse {
    /// Setting key.
    pub key: String,
    /// Stored value.
    pub value: String,
}

/// Write a setting. The cache is dropped so the next read sees it.
pub async fn put_setting(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Path(key): Path<String>,
    Json(req): Json<PutSettingRequest>,
) -> Result<Json<SettingResponse>, ApiError> {
    if key.trim().is_empty() {
        return Err(ApiError::BadRequest("Setting key must not be empty".into()));
    }
    tracing::info!(admin_id = %admin.admin_id, key = %key, "Setting updated");
    state.settings.put(&key, &req.value).await?;
    Ok(Json(SettingResponse {
        key,
        value: req.value,
    }))
}

/// Refresh result.
#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    /// Settings loaded.
    pub count: usize,
}

/// Reload every setting from the store.
pub async fn refresh_settings(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
) -> Result<Json<RefreshResponse>, ApiError> {
    let count = state.settings.refresh().await?;
    tracing::info!(admin_id = %admin.admin_id, count, "Settings refreshed");
    Ok(Json(RefreshResponse { count }))
}
