//! Credit balance, ledger and audit handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Serialize;

use creditline_core::{BalanceAudit, LedgerEntry};

use super::Pagination;
use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Balance response.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// Current balance in credits.
    pub balance: i64,
}

/// Get current credit balance.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account = state
        .store
        .get_account(&auth.account_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;

    Ok(Json(BalanceResponse {
        balance: account.balance,
    }))
}

/// Ledger page response.
#[derive(Debug, Serialize)]
pub struct LedgerResponse {
    /// Entries, newest first.
    pub entries: Vec<LedgerEntry>,
    /// Whether there are more entries.
    pub has_more: bool,
}

/// List ledger history.
pub async fn list_ledger(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<Pagination>,
) -> Result<Json<LedgerResponse>, ApiError> {
    state
        .store
        .get_account(&auth.account_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;

    // Fetch one more than requested to determine has_more
    let rows = state
        .store
        .list_ledger(&auth.account_id, query.limit() + 1, query.offset)
        .await?;
    let (entries, has_more) = query.page(rows);

    Ok(Json(LedgerResponse { entries, has_more }))
}

/// Compare the balance with the one rebuilt from the ledger.
pub async fn audit(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceAudit>, ApiError> {
    Ok(Json(state.credits.audit(&auth.account_id).await?))
}
