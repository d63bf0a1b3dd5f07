//! API error types and responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use creditline_core::BillingError;
use creditline_store::StoreError;

use crate::jobs::ProviderError;
use crate::stripe::StripeError;

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unauthorized - missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad request - invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Conflict - resource already exists or invalid state transition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Insufficient credits.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Current balance.
        balance: i64,
        /// Required amount.
        required: i64,
    },

    /// The account already redeemed a referral code.
    #[error("account has already been referred")]
    AlreadyReferred,

    /// The referral code belongs to the caller.
    #[error("cannot redeem your own referral code")]
    SelfReferral,

    /// The referral code does not exist.
    #[error("invalid referral code: {0}")]
    InvalidReferralCode(String),

    /// Referrals are switched off.
    #[error("referral system is disabled")]
    ReferralDisabled,

    /// Webhook or callback authentication failed.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// A required integration is not configured.
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),

    /// External service error.
    #[error("external service error: {0}")]
    ExternalService(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                self.to_string(),
                None,
            ),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), None),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), None),
            Self::InsufficientCredits { balance, required } => (
                StatusCode::PAYMENT_REQUIRED,
                "insufficient_credits",
                self.to_string(),
                Some(serde_json::json!({
                    "balance": balance,
                    "required": required
                })),
            ),
            Self::AlreadyReferred => (
                StatusCode::CONFLICT,
                "already_referred",
                self.to_string(),
                None,
            ),
            Self::SelfReferral => (
                StatusCode::BAD_REQUEST,
                "self_referral",
                self.to_string(),
                None,
            ),
            Self::InvalidReferralCode(_) => (
                StatusCode::NOT_FOUND,
                "invalid_referral_code",
                self.to_string(),
                None,
            ),
            Self::ReferralDisabled => (
                StatusCode::FORBIDDEN,
                "referral_disabled",
                self.to_string(),
                None,
            ),
            Self::SignatureInvalid => (
                StatusCode::UNAUTHORIZED,
                "signature_invalid",
                self.to_string(),
                None,
            ),
            Self::NotConfigured(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "not_configured",
                msg.clone(),
                None,
            ),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
            Self::ExternalService(msg) => (
                StatusCode::BAD_GATEWAY,
                "external_service_error",
                msg.clone(),
                None,
            ),
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
                details,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InsufficientCredits { balance, required } => {
                Self::InsufficientCredits { balance, required }
            }
            BillingError::AccountNotFound { .. }
            | BillingError::OrderNotFound { .. }
            | BillingError::JobNotFound { .. } => Self::NotFound(err.to_string()),
            BillingError::AlreadyReferred => Self::AlreadyReferred,
            BillingError::SelfReferral => Self::SelfReferral,
            BillingError::InvalidReferralCode { code } => Self::InvalidReferralCode(code),
            BillingError::ReferralDisabled => Self::ReferralDisabled,
            BillingError::SignatureInvalid => Self::SignatureInvalid,
            BillingError::ProviderFailure(msg) => Self::ExternalService(msg),
            BillingError::InvalidTransition { .. } => Self::Conflict(err.to_string()),
            BillingError::InvalidAmount(msg) | BillingError::InvalidRequest(msg) => {
                Self::BadRequest(msg)
            }
            BillingError::InvalidId(e) => Self::BadRequest(e.to_string()),
            BillingError::Configuration(msg) => Self::NotConfigured(msg),
            BillingError::Storage(msg) => Self::Internal(msg),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => Self::Conflict(msg),
            other => BillingError::from(other).into(),
        }
    }
}

impl From<StripeError> for ApiError {
    fn from(err: StripeError) -> Self {
        match err {
            StripeError::InvalidSignature | StripeError::StaleSignature { .. } => {
                Self::SignatureInvalid
            }
            StripeError::Configuration(msg) => Self::NotConfigured(msg),
            other => Self::ExternalService(other.to_string()),
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        Self::ExternalService(err.to_string())
    }
}
