//! Stripe integration.
//!
//! Stripe handles:
//! - Credit purchases via Checkout
//! - Webhook signature verification for payment events

pub mod client;
pub mod types;

pub use client::{CheckoutRequest, StripeClient, StripeError};
pub use types::*;
