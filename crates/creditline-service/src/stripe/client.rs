//! Stripe API client implementation.

use std::time::Duration;

use reqwest::Client;

use super::types::{CheckoutSession, StripeErrorResponse};
use crate::crypto::{constant_time_eq, hmac_sha256_hex};

/// Error type for Stripe operations.
#[derive(Debug, thiserror::Error)]
pub enum StripeError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Stripe API returned an error.
    #[error("Stripe API error: {error_type} - {message}")]
    Api {
        /// Error type.
        error_type: String,
        /// Error message.
        message: String,
        /// Error code.
        code: Option<String>,
    },

    /// Invalid webhook signature.
    #[error("Invalid webhook signature")]
    InvalidSignature,

    /// Webhook signature timestamp outside the tolerance window.
    #[error("Webhook signature timestamp {timestamp} is outside the tolerance window")]
    StaleSignature {
        /// Timestamp from the signature header.
        timestamp: i64,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Parameters of a credit purchase checkout.
#[derive(Debug, Clone)]
pub struct CheckoutRequest<'a> {
    /// Our order id; sent as `client_reference_id` and `metadata[orderId]`.
    pub order_id: &'a str,
    /// Account paying; sent as `metadata[accountId]`.
    pub account_id: &'a str,
    /// Product line shown on the checkout page.
    pub product_name: &'a str,
    /// Amount in the currency's minor unit.
    pub amount_minor: i64,
    /// ISO currency code, lowercase.
    pub currency: &'a str,
    /// Credits the buyer will receive (for display).
    pub credits: i64,
    /// Prefills the email field.
    pub customer_email: Option<&'a str>,
    /// Redirect after payment.
    pub success_url: &'a str,
    /// Redirect after abandoning.
    pub cancel_url: &'a str,
}

/// Stripe API client.
#[derive(Debug, Clone)]
pub struct StripeClient {
    client: Client,
    api_key: String,
    base_url: String,
    webhook_secret: Option<String>,
    tolerance: Duration,
}

impl StripeClient {
    /// Stripe API base URL.
    pub const BASE_URL: &'static str = "https://api.stripe.com/v1";

    /// Create a new Stripe client.
    ///
    /// # Arguments
    ///
    /// * `api_key` - Stripe secret API key (`sk_test_...` or `sk_live_...`)
    /// * `webhook_secret` - Optional webhook signing secret (`whsec_...`)
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        api_key: impl Into<String>,
        webhook_secret: Option<String>,
    ) -> Result<Self, StripeError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: Self::BASE_URL.to_string(),
            webhook_secret,
            tolerance: Duration::from_secs(300),
        })
    }

    /// Point the client at another API base (a mock server in tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the maximum accepted age of a webhook signature.
    #[must_use]
    pub const fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Whether webhook verification is possible.
    #[must_use]
    pub const fn has_webhook_secret(&self) -> bool {
        self.webhook_secret.is_some()
    }

    /// Create a Checkout session for purchasing a credit package.
    ///
    /// The order id travels as `client_reference_id`, as session metadata and
    /// as payment intent metadata, so every later event can be correlated.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or Stripe rejects it.
    pub async fn create_checkout_session(
        &self,
        request: &CheckoutRequest<'_>,
    ) -> Result<CheckoutSession, StripeError> {
        let mut params = vec![
            ("mode", "payment".to_string()),
            ("success_url", request.success_url.to_string()),
            ("cancel_url", request.cancel_url.to_string()),
            ("client_reference_id", request.order_id.to_string()),
            (
                "line_items[0][price_data][currency]",
                request.currency.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]",
                request.product_name.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][description]",
                format!("{} credits", request.credits),
            ),
            (
                "line_items[0][price_data][unit_amount]",
                request.amount_minor.to_string(),
            ),
            ("line_items[0][quantity]", "1".to_string()),
            ("metadata[orderId]", request.order_id.to_string()),
            ("metadata[accountId]", request.account_id.to_string()),
            (
                "payment_intent_data[metadata][orderId]",
                request.order_id.to_string(),
            ),
        ];

        if let Some(email) = request.customer_email {
            params.push(("customer_email", email.to_string()));
        }

        tracing::debug!(
            order_id = %request.order_id,
            amount_minor = request.amount_minor,
            currency = %request.currency,
            "Creating Stripe checkout session"
        );

        let response = self
            .client
            .post(format!("{}/checkout/sessions", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(&params)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Retrieve a Checkout session by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the session does not exist.
    pub async fn get_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, StripeError> {
        let response = self
            .client
            .get(format!("{}/checkout/sessions/{session_id}", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Verify a webhook signature against the current time.
    ///
    /// # Errors
    ///
    /// See [`StripeClient::verify_webhook_signature_at`].
    pub fn verify_webhook_signature(&self, payload: &str, header: &str) -> Result<(), StripeError> {
        self.verify_webhook_signature_at(payload, header, chrono::Utc::now().timestamp())
    }

    /// Verify a `Stripe-Signature` header (`t=<ts>,v1=<hex>[,v1=...]`).
    ///
    /// The signed payload is `"<ts>.<raw body>"`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` without a webhook secret, `InvalidSignature`
    /// if the header is malformed or no `v1` signature matches, and
    /// `StaleSignature` if `ts` is further than the tolerance from `now`.
    pub fn verify_webhook_signature_at(
        &self,
        payload: &str,
        header: &str,
        now: i64,
    ) -> Result<(), StripeError> {
        let secret = self
            .webhook_secret
            .as_ref()
            .ok_or_else(|| StripeError::Configuration("Webhook secret not configured".into()))?;

        let mut timestamp: Option<&str> = None;
        let mut signatures: Vec<&str> = Vec::new();

        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", ts)) => timestamp = Some(ts),
                Some(("v1", sig)) => signatures.push(sig),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(StripeError::InvalidSignature)?;
        let ts: i64 = timestamp.parse().map_err(|_| StripeError::InvalidSignature)?;

        if signatures.is_empty() {
            return Err(StripeError::InvalidSignature);
        }

        let expected = hmac_sha256_hex(secret, &format!("{timestamp}.{payload}"));
        if !signatures.iter().any(|sig| constant_time_eq(&expected, sig)) {
            return Err(StripeError::InvalidSignature);
        }

        let tolerance = i64::try_from(self.tolerance.as_secs()).unwrap_or(i64::MAX);
        if (now - ts).abs() > tolerance {
            return Err(StripeError::StaleSignature { timestamp: ts });
        }

        Ok(())
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, StripeError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        match response.json::<StripeErrorResponse>().await {
            Ok(stripe_error) => Err(StripeError::Api {
                error_type: stripe_error.error.error_type,
                message: stripe_error.error.message,
                code: stripe_error.error.code,
            }),
            Err(_) => Err(StripeError::Api {
                error_type: "unknown".to_string(),
                message: format!("HTTP {status}"),
                code: None,
            }),
        }
    }
}

/// Build a `Stripe-Signature` header for `payload`, as Stripe would.
#[must_use]
pub fn sign_webhook_payload(secret: &str, payload: &str, timestamp: i64) -> String {
    let sig = hmac_sha256_hex(secret, &format!("{timestamp}.{payload}"));
    format!("t={timestamp},v1={sig}")
}
