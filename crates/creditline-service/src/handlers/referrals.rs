//! Referral handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use creditline_core::ReferralEvent;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::referral::{CodeValidation, ReferralInfo};
use crate::state::AppState;

/// Code response.
#[derive(Debug, Serialize)]
pub struct CodeResponse {
    /// The caller's referral code.
    pub code: String,
}

/// Get (issuing on first call) the caller's referral code.
pub async fn get_code(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<CodeResponse>, ApiError> {
    let code = state.referrals.code_for(&auth.account_id).await?;
    Ok(Json(CodeResponse { code }))
}

/// Check whether a code exists. Public.
pub async fn validate_code(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<CodeValidation>, ApiError> {
    Ok(Json(state.referrals.validate(&code).await?))
}

/// Apply request.
#[derive(Debug, Deserialize)]
pub struct ApplyRequest {
    /// Code to redeem (case-insensitive).
    pub code: String,
}

/// Apply response.
#[derive(Debug, Serialize)]
pub struct ApplyResponse {
    /// The recorded redemption.
    pub referral: ReferralEvent,
    /// Caller's balance afterwards.
    pub balance: i64,
}

/// Redeem a referral code.
pub async fn apply_code(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<ApplyRequest>,
) -> Result<Json<ApplyResponse>, ApiError> {
    let referral = state.referrals.apply(&auth.account_id, &body.code).await?;
    let balance = state
        .store
        .get_account(&auth.account_id)
        .await?
        .map_or(0, |a| a.balance);
    Ok(Json(ApplyResponse { referral, balance }))
}

/// Stats response.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Accounts that redeemed the caller's code.
    pub referral_count: u64,
    /// Credits earned from redemptions.
    pub total_bonus_earned: i64,
    /// Redemptions, newest first.
    pub referrals: Vec<ReferralEvent>,
}

/// The caller's referral totals.
pub async fn stats(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.referrals.stats(&auth.account_id).await?;
    let referrals = state.referrals.history(&auth.account_id).await?;
    Ok(Json(StatsResponse {
        referral_count: stats.referral_count,
        total_bonus_earned: stats.total_bonus_earned,
        referrals,
    }))
}

/// The caller's code, referral status and current bonuses.
pub async fn info(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<ReferralInfo>, ApiError> {
    Ok(Json(state.referrals.info(&auth.account_id).await?))
}
