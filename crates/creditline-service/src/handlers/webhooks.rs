//! Webhook handlers for Stripe, Shopier and the generation provider.
//!
//! Notifications are authenticated before anything is parsed. Once
//! authenticated, every handled or ignored notification is acknowledged with
//! 200 so providers stop retrying.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Redirect;
use axum::{Form, Json};
use serde::{Deserialize, Serialize};

use crate::crypto::{constant_time_eq, hmac_sha256_hex};
use crate::error::ApiError;
use crate::jobs::ProviderTask;
use crate::payments::IntakeOutcome;
use crate::shopier::OsbNotification;
use crate::state::AppState;

/// Header carrying the hex HMAC-SHA256 of a provider callback body.
pub const PROVIDER_SIGNATURE_HEADER: &str = "x-provider-signature";

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Whether the webhook was accepted.
    pub received: bool,
    /// What it did.
    pub outcome: IntakeOutcome,
}

impl From<IntakeOutcome> for WebhookResponse {
    fn from(outcome: IntakeOutcome) -> Self {
        Self {
            received: true,
            outcome,
        }
    }
}

/// Handle Stripe webhooks. The raw body is needed for the signature.
pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook without signature header");
            ApiError::SignatureInvalid
        })?;

    let outcome = state
        .payments
        .handle_stripe_webhook(&body, signature)
        .await?;
    Ok(Json(outcome.into()))
}

/// Handle Shopier OSB notifications (form-encoded).
pub async fn shopier_osb(
    State(state): State<Arc<AppState>>,
    Form(notification): Form<OsbNotification>,
) -> Result<Json<WebhookResponse>, ApiError> {
    let outcome = state.payments.handle_shopier_osb(&notification).await?;
    Ok(Json(outcome.into()))
}

/// Fields Shopier sends back with the buyer.
#[derive(Debug, Default, Deserialize)]
pub struct ShopierReturn {
    /// Merchant order id.
    #[serde(default)]
    pub platform_order_id: Option<String>,
    /// Payment status as Shopier reports it.
    #[serde(default)]
    pub status: Option<String>,
}

/// Buyer returning from Shopier by GET. Redirects only; credits are granted
/// by the OSB notification.
pub async fn shopier_return_get(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ShopierReturn>,
) -> Redirect {
    shopier_redirect(&state, &params)
}

/// Buyer returning from Shopier by form POST.
pub async fn shopier_return_post(
    State(state): State<Arc<AppState>>,
    Form(params): Form<ShopierReturn>,
) -> Redirect {
    shopier_redirect(&state, &params)
}

fn shopier_redirect(state: &AppState, params: &ShopierReturn) -> Redirect {
    tracing::debug!(
        order = params.platform_order_id.as_deref().unwrap_or("-"),
        status = params.status.as_deref().unwrap_or("-"),
        "Shopier return"
    );
    Redirect::to(&state.payments.shopier_return_url(
        params.platform_order_id.as_deref(),
        params.status.as_deref(),
    ))
}

/// Provider callback response.
#[derive(Debug, Serialize)]
pub struct ProviderCallbackResponse {
    /// Whether the callback was accepted.
    pub received: bool,
    /// Whether it changed a job.
    pub applied: bool,
}

/// Handle asynchronous generation results.
pub async fn provider_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<ProviderCallbackResponse>, ApiError> {
    let secret = state
        .config
        .provider_callback_secret
        .as_deref()
        .ok_or_else(|| ApiError::NotConfigured("provider callback secret".into()))?;

    let signature = headers
        .get(PROVIDER_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::SignatureInvalid)?;

    if !constant_time_eq(&signature.to_ascii_lowercase(), &hmac_sha256_hex(secret, &body)) {
        tracing::warn!("Provider callback signature mismatch");
        return Err(ApiError::SignatureInvalid);
    }

    let task: ProviderTask = serde_json::from_str(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid callback body: {e}")))?;
    let task_id = task
        .task_id
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("Callback without task_id".into()))?;
    let status = task
        .task_status()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let update = state.jobs.handle_task_update(task_id, status).await?;
    let applied = update.is_some_and(|u| u.transition.is_apply());

    tracing::info!(task_id, applied, "Provider callback");
    Ok(Json(ProviderCallbackResponse {
        received: true,
        applied,
    }))
}
