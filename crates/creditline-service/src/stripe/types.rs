//! Stripe API types.

use serde::Deserialize;

/// Stripe Checkout session object.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    /// Session ID.
    pub id: String,
    /// Checkout URL to redirect the user to.
    #[serde(default)]
    pub url: Option<String>,
    /// Payment status (`paid`, `unpaid`, `no_payment_required`).
    #[serde(default)]
    pub payment_status: Option<String>,
    /// Client reference ID (our order id).
    #[serde(default)]
    pub client_reference_id: Option<String>,
    /// Payment intent ID.
    #[serde(default)]
    pub payment_intent: Option<String>,
    /// Metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl CheckoutSession {
    /// Our order id, from `client_reference_id` or `metadata.orderId`.
    #[must_use]
    pub fn order_id(&self) -> Option<&str> {
        self.client_reference_id
            .as_deref()
            .or_else(|| metadata_order_id(&self.metadata))
    }

    /// Whether the session's money has been collected.
    #[must_use]
    pub fn is_paid(&self) -> bool {
        matches!(
            self.payment_status.as_deref(),
            Some("paid" | "no_payment_required")
        )
    }
}

/// Stripe `PaymentIntent` object, as carried by `payment_intent.*` events.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    /// Payment intent ID.
    pub id: String,
    /// Metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Last payment error, if any.
    #[serde(default)]
    pub last_payment_error: Option<PaymentError>,
}

/// Error attached to a failed payment intent.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentError {
    /// Human-readable message.
    #[serde(default)]
    pub message: Option<String>,
}

/// Stripe `Charge` object, as carried by `charge.refunded`.
#[derive(Debug, Clone, Deserialize)]
pub struct Charge {
    /// Charge ID.
    pub id: String,
    /// Payment intent the charge belongs to.
    #[serde(default)]
    pub payment_intent: Option<String>,
    /// Metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Read `metadata.orderId` from a Stripe object.
#[must_use]
pub fn metadata_order_id(metadata: &serde_json::Value) -> Option<&str> {
    metadata.get("orderId").and_then(serde_json::Value::as_str)
}

/// Stripe webhook event.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    /// Event ID.
    pub id: String,
    /// Event type (e.g., "checkout.session.completed").
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event data.
    pub data: WebhookEventData,
}

/// Webhook event data container.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    /// The event object.
    pub object: serde_json::Value,
}

/// Stripe API error response.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeErrorResponse {
    /// Error details.
    pub error: StripeErrorDetail,
}

/// Stripe error detail.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeErrorDetail {
    /// Error type.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Error message.
    #[serde(default)]
    pub message: String,
    /// Error code.
    #[serde(default)]
    pub code: Option<String>,
}
