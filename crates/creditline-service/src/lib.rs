//! Creditline HTTP API service.
//!
//! This crate provides the HTTP surface over the credit ledger:
//!
//! - Accounts, balances and the ledger
//! - Credit package checkout through Stripe and Shopier
//! - Generation jobs with held credits and refund on failure
//! - Referral codes
//! - Payment and provider webhooks
//!
//! # Authentication
//!
//! 1. **JWT bearer tokens** (HS256) for end-user requests
//! 2. **Admin API key** (`X-Admin-Key`) for manual adjustments and settings
//!
//! Webhooks authenticate with provider signatures or credentials instead.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Webhook handlers need async for consistency

pub mod auth;
pub mod config;
pub mod credits;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod payments;
pub mod referral;
pub mod routes;
pub mod settings;
pub mod shopier;
pub mod state;
pub mod stripe;

pub use config::ServiceConfig;
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
pub use stripe::{StripeClient, StripeError};
