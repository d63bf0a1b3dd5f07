//! Account management handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use creditline_core::{Account, AccountId};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Account response.
#[derive(Debug, Serialize)]
pub struct AccountResponse {
    /// Account ID.
    pub account_id: AccountId,
    /// Email, if known.
    pub email: Option<String>,
    /// Current balance in credits.
    pub balance: i64,
    /// The account's referral code, once issued.
    pub referral_code: Option<String>,
    /// Whether the account redeemed a referral code.
    pub referred: bool,
    /// Created timestamp.
    pub created_at: String,
}

impl From<&Account> for AccountResponse {
    fn from(account: &Account) -> Self {
        Self {
            account_id: account.id,
            email: account.email.clone(),
            balance: account.balance,
            referral_code: account.referral_code.clone(),
            referred: account.is_referred(),
            created_at: account.created_at.to_rfc3339(),
        }
    }
}

/// Create account request (optional fields for metadata).
#[derive(Debug, Default, Deserialize)]
pub struct CreateAccountRequest {
    /// Email; defaults to the token's email claim.
    #[serde(default)]
    pub email: Option<String>,
}

/// Create the caller's account and grant the signup bonus.
pub async fn create_account(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), ApiError> {
    let account = Account::new(auth.account_id, body.email.or(auth.email));
    let bonus = state.settings.signup_bonus().await?;

    let account = state
        .store
        .open_account(&account, bonus, "signup bonus")
        .await?
        .ok_or_else(|| ApiError::Conflict("Account already exists".into()))?;

    tracing::info!(account_id = %auth.account_id, bonus, "Account created");

    Ok((StatusCode::CREATED, Json(AccountResponse::from(&account))))
}

/// Get the current user's account.
pub async fn get_account(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<AccountResponse>, ApiError> {
    let account = state
        .store
        .get_account(&auth.account_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;

    Ok(Json(AccountResponse::from(&account)))
}
