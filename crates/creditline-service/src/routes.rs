//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post, put};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{accounts, admin, credits, health, jobs, payments, referrals, webhooks};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent requests for job endpoints.
/// Job creation fans out to the generation provider.
const JOBS_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
/// - `GET /v1/payments/packages` - Credit package catalog
/// - `GET /v1/referrals/validate/:code` - Check a referral code
///
/// ## Accounts, credits, payments, referrals (JWT auth)
/// - `POST /v1/accounts`, `GET /v1/accounts/me`
/// - `GET /v1/credits/balance`, `GET /v1/credits/ledger`, `GET /v1/credits/audit`
/// - `POST /v1/payments/checkout`, `GET /v1/payments`
/// - `GET /v1/referrals/code`, `POST /v1/referrals/apply`,
///   `GET /v1/referrals/stats`, `GET /v1/referrals/info`
///
/// ## Jobs (JWT auth, own concurrency limit)
/// - `POST /v1/jobs`, `POST /v1/jobs/batch`, `GET /v1/jobs`, `GET /v1/jobs/:id`
///
/// ## Admin (`X-Admin-Key`)
/// - `POST /v1/admin/credits/{add,deduct,refund}`
/// - `POST /v1/admin/jobs/:id/cancel`
/// - `PUT /v1/admin/settings/:key`, `POST /v1/admin/settings/refresh`
///
/// ## Webhooks (signature verification)
/// - `POST /webhooks/stripe` - Stripe events
/// - `POST /webhooks/shopier/osb` - Shopier payment notifications
/// - `POST /webhooks/provider` - Generation results
/// - `GET|POST /payments/shopier/return` - Buyer redirect back from Shopier
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    let job_routes = Router::new()
        .route("/", post(jobs::create_job).get(jobs::list_jobs))
        .route("/batch", post(jobs::create_batch))
        .route("/:id", get(jobs::get_job))
        .layer(ConcurrencyLimitLayer::new(JOBS_MAX_CONCURRENT_REQUESTS));

    let admin_routes = Router::new()
        .route("/credits/add", post(admin::add_credits))
        .route("/credits/deduct", post(admin::deduct_credits))
        .route("/credits/refund", post(admin::refund_credits))
        .route("/jobs/:id/cancel", post(admin::cancel_job))
        .route("/settings/refresh", post(admin::refresh_settings))
        .route("/settings/:key", put(admin::put_setting));

    let api_routes = Router::new()
        // Accounts
        .route("/accounts", post(accounts::create_account))
        .route("/accounts/me", get(accounts::get_account))
        // Credits
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/ledger", get(credits::list_ledger))
        .route("/credits/audit", get(credits::audit))
        // Payments
        .route("/payments", get(payments::list_payments))
        .route("/payments/packages", get(payments::list_packages))
        .route("/payments/checkout", post(payments::checkout))
        // Referrals
        .route("/referrals/code", get(referrals::get_code))
        .route("/referrals/validate/:code", get(referrals::validate_code))
        .route("/referrals/apply", post(referrals::apply_code))
        .route("/referrals/stats", get(referrals::stats))
        .route("/referrals/info", get(referrals::info))
        .nest("/admin", admin_routes)
        .nest("/jobs", job_routes)
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        // API v1 routes (rate limited)
        .nest("/v1", api_routes)
        // Webhooks (no rate limit - controlled by external services)
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
        .route("/webhooks/shopier/osb", post(webhooks::shopier_osb))
        .route("/webhooks/provider", post(webhooks::provider_callback))
        .route(
            "/payments/shopier/return",
            get(webhooks::shopier_return_get).post(webhooks::shopier_return_post),
        )
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
