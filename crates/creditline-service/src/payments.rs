//! Payment intake.
//!
//! Turns provider notifications into at most one credit grant per order.
//! Every status change goes through a single atomic store call
//! ([`Store::settle_payment_order`] and friends), guarded by the order's
//! own status, so redelivered or out-of-order notifications are harmless.
//!
//! Checkout redirects never grant credits; only authenticated
//! server-to-server notifications do.

use std::sync::Arc;

use serde::Serialize;

use creditline_core::{
    AccountId, BillingError, PaymentOrder, PaymentOrderId, PaymentProvider,
    PricingConfig, Transition,
};
use creditline_store::{OrderUpdate, Store};

use crate::error::ApiError;
use crate::shopier::{merchant_order_id, OsbNotification, ShopierForm, ShopierGateway};
use crate::stripe::{
    metadata_order_id, Charge, CheckoutRequest, CheckoutSession, PaymentIntent, StripeClient,
    WebhookEvent,
};

/// What a checkout start hands back to the buyer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum Checkout {
    /// Redirect to Stripe Checkout.
    Stripe {
        /// Our order id.
        order_id: PaymentOrderId,
        /// Stripe session id.
        session_id: String,
        /// Hosted checkout URL.
        checkout_url: String,
    },
    /// Post a signed form to Shopier.
    Shopier {
        /// Our order id.
        order_id: PaymentOrderId,
        /// The signed form.
        form: ShopierForm,
    },
}

/// How a notification was handled. Every variant is acknowledged to the
/// provider with a success status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeOutcome {
    /// Credits granted.
    Settled,
    /// Payment in flight; waiting for a later event.
    Processing,
    /// Order marked failed.
    Failed,
    /// Order refunded and grant reversed.
    Refunded,
    /// Already handled; nothing changed.
    Duplicate,
    /// The order is in a terminal state that forbids this change.
    Rejected,
    /// Event type or status this service does not act on.
    Ignored,
}

/// Checkout and notification handling for both providers.
#[derive(Clone)]
pub struct PaymentIntake {
    store: Arc<dyn Store>,
    pricing: Arc<PricingConfig>,
    stripe: Option<Arc<StripeClient>>,
    shopier: Option<Arc<ShopierGateway>>,
    frontend_url: String,
}

impl PaymentIntake {
    /// Create the intake service.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        pricing: Arc<PricingConfig>,
        stripe: Option<Arc<StripeClient>>,
        shopier: Option<Arc<ShopierGateway>>,
        frontend_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            pricing,
            stripe,
            shopier,
            frontend_url: frontend_url.into().trim_end_matches('/').to_string(),
        }
    }

    // =========================================================================
    // Checkout
    // =========================================================================

    /// Create a pending order for `package_id` and the provider payload the
    /// buyer needs to pay it.
    ///
    /// # Errors
    ///
    /// - `NotConfigured` if the provider is not set up.
    /// - `BadRequest` for an unknown package.
    /// - `NotFound` for an unknown account.
    /// - `ExternalService` if Stripe rejects the session.
    pub async fn start_checkout(
        &self,
        account_id: &AccountId,
        email: Option<&str>,
        provider: PaymentProvider,
        package_id: &str,
    ) -> Result<Checkout, ApiError> {
        let package = self.pricing.package(package_id)?;
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| BillingError::AccountNotFound {
                account_id: account_id.to_string(),
            })?;
        let email = email.or(account.email.as_deref());
        let order_id = PaymentOrderId::generate();

        match provider {
            PaymentProvider::Stripe => {
                let stripe = self
                    .stripe
                    .as_ref()
                    .ok_or_else(|| ApiError::NotConfigured("Stripe not configured".into()))?;

                let order_ref = order_id.to_string();
                let account_ref = account_id.to_string();
                let success_url = format!(
                    "{}/payment/success?order_id={order_ref}",
                    self.frontend_url
                );
                let cancel_url = format!("{}/payment/cancel?order_id={order_ref}", self.frontend_url);

                let session = stripe
                    .create_checkout_session(&CheckoutRequest {
                        order_id: &order_ref,
                        account_id: &account_ref,
                        product_name: &package.name,
                        amount_minor: package.price_minor,
                        currency: &package.currency,
                        credits: package.credits_granted(),
                        customer_email: email,
                        success_url: &success_url,
                        cancel_url: &cancel_url,
                    })
                    .await?;

                let checkout_url = session.url.clone().ok_or_else(|| {
                    ApiError::ExternalService("Stripe session has no checkout URL".into())
                })?;

                let order = PaymentOrder::new(
                    order_id,
                    *account_id,
                    PaymentProvider::Stripe,
                    session.id.clone(),
                    package,
                );
                self.store.create_payment_order(&order).await?;

                tracing::info!(
                    account_id = %account_id,
                    order_id = %order_id,
                    session_id = %session.id,
                    package = %package.id,
                    "Stripe checkout started"
                );

                Ok(Checkout::Stripe {
                    order_id,
                    session_id: session.id,
                    checkout_url,
                })
            }
            PaymentProvider::Shopier => {
                let shopier = self
                    .shopier
                    .as_ref()
                    .ok_or_else(|| ApiError::NotConfigured("Shopier not configured".into()))?;

                let merchant_id =
                    merchant_order_id(account_id, chrono::Utc::now().timestamp_millis());
                let order = PaymentOrder::new(
                    order_id,
                    *account_id,
                    PaymentProvider::Shopier,
                    merchant_id.clone(),
                    package,
                );
                self.store.create_payment_order(&order).await?;

                tracing::info!(
                    account_id = %account_id,
                    order_id = %order_id,
                    merchant_order_id = %merchant_id,
                    package = %package.id,
                    "Shopier checkout started"
                );

                Ok(Checkout::Shopier {
                    order_id,
                    form: shopier.payment_form(&merchant_id, package, email),
                })
            }
        }
    }

    /// Where the buyer's browser goes after Shopier's payment page.
    ///
    /// Only builds a URL; order state is untouched.
    #[must_use]
    pub fn shopier_return_url(
        &self,
        platform_order_id: Option<&str>,
        status: Option<&str>,
    ) -> String {
        let status = match status {
            Some(s) if s.eq_ignore_ascii_case("success") => "success",
            Some(_) => "failed",
            None => "pending",
        };
        let mut params = vec![("provider", "shopier"), ("status", status)];
        if let Some(id) = platform_order_id {
            params.push(("order", id));
        }

        let base = format!("{}/payment/result", self.frontend_url);
        match reqwest::Url::parse_with_params(&base, &params) {
            Ok(url) => url.into(),
            Err(e) => {
                tracing::warn!(error = %e, frontend_url = %self.frontend_url, "Invalid frontend URL");
                base
            }
        }
    }

    // =========================================================================
    // Settlement primitives
    // =========================================================================

    /// Grant an order's credits unless already granted.
    ///
    /// # Errors
    ///
    /// Returns `OrderNotFound` for an unknown order.
    pub async fn settle(
        &self,
        order_id: &PaymentOrderId,
        payment_ref: Option<&str>,
    ) -> creditline_core::Result<OrderUpdate> {
        let update = self.store.settle_payment_order(order_id, payment_ref).await?;
        match update.transition {
            Transition::Apply => tracing::info!(
                order_id = %order_id,
                account_id = %update.order.account_id,
                amount = update.order.credits_granted(),
                "Payment order settled"
            ),
            Transition::AlreadyApplied => tracing::info!(
                order_id = %order_id,
                status = %update.order.status,
                "Duplicate settlement notification ignored"
            ),
            Transition::Rejected => tracing::warn!(
                order_id = %order_id,
                status = %update.order.status,
                "Settlement rejected for terminal order; reconcile manually"
            ),
        }
        Ok(update)
    }

    async fn mark_processing(
        &self,
        order_id: &PaymentOrderId,
        payment_ref: Option<&str>,
    ) -> creditline_core::Result<OrderUpdate> {
        let update = self.store.mark_payment_processing(order_id, payment_ref).await?;
        log_transition(&update, "processing");
        Ok(update)
    }

    async fn fail(&self, order_id: &PaymentOrderId, error: &str) -> creditline_core::Result<OrderUpdate> {
        let update = self.store.fail_payment_order(order_id, error).await?;
        log_transition(&update, "failed");
        Ok(update)
    }

    async fn refund(&self, order_id: &PaymentOrderId) -> creditline_core::Result<OrderUpdate> {
        let update = self.store.refund_payment_order(order_id).await?;
        if update.transition.is_apply() {
            tracing::info!(
                order_id = %order_id,
                account_id = %update.order.account_id,
                amount = update.entry.as_ref().map_or(0, |e| e.amount),
                "Payment order refunded; grant reversed"
            );
        } else {
            log_transition(&update, "refunded");
        }
        Ok(update)
    }

    // =========================================================================
    // Stripe
    // =========================================================================

    /// Verify and handle a raw Stripe webhook delivery.
    ///
    /// # Errors
    ///
    /// - `NotConfigured` without a Stripe client or webhook secret.
    /// - `SignatureInvalid` for a bad or stale signature; nothing changes.
    /// - `BadRequest` for an unparseable event.
    /// - `NotFound` when the event references an unknown order.
    pub async fn handle_stripe_webhook(
        &self,
        payload: &str,
        signature: &str,
    ) -> Result<IntakeOutcome, ApiError> {
        let stripe = self
            .stripe
            .as_ref()
            .ok_or_else(|| ApiError::NotConfigured("Stripe not configured".into()))?;

        if let Err(e) = stripe.verify_webhook_signature(payload, signature) {
            tracing::warn!(error = %e, "Stripe webhook signature rejected");
            return Err(e.into());
        }

        let event: WebhookEvent = serde_json::from_str(payload)
            .map_err(|e| ApiError::BadRequest(format!("Invalid event payload: {e}")))?;

        self.handle_stripe_event(&event).await
    }

    /// Handle an already verified Stripe event.
    ///
    /// # Errors
    ///
    /// See [`PaymentIntake::handle_stripe_webhook`].
    pub async fn handle_stripe_event(&self, event: &WebhookEvent) -> Result<IntakeOutcome, ApiError> {
        tracing::info!(event_id = %event.id, event_type = %event.event_type, "Stripe event received");

        let outcome = match event.event_type.as_str() {
            "checkout.session.completed" => {
                let session: CheckoutSession = parse_object(event)?;
                let order = self.stripe_order_for_session(&session).await?;
                if session.is_paid() {
                    settled(&self.settle(&order.id, session.payment_intent.as_deref()).await?)
                } else {
                    let update = self
                        .mark_processing(&order.id, session.payment_intent.as_deref())
                        .await?;
                    outcome_of(&update, IntakeOutcome::Processing)
                }
            }
            "checkout.session.async_payment_succeeded" => {
                let session: CheckoutSession = parse_object(event)?;
                let order = self.stripe_order_for_session(&session).await?;
                settled(&self.settle(&order.id, session.payment_intent.as_deref()).await?)
            }
            "checkout.session.async_payment_failed" => {
                let session: CheckoutSession = parse_object(event)?;
                let order = self.stripe_order_for_session(&session).await?;
                let update = self.fail(&order.id, "asynchronous payment failed").await?;
                outcome_of(&update, IntakeOutcome::Failed)
            }
            "payment_intent.payment_failed" => {
                let intent: PaymentIntent = parse_object(event)?;
                let order = self
                    .stripe_order_by_ref(metadata_order_id(&intent.metadata), &intent.id)
                    .await?;
                let message = intent
                    .last_payment_error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "payment failed".to_string());
                let update = self.fail(&order.id, &message).await?;
                outcome_of(&update, IntakeOutcome::Failed)
            }
            "charge.refunded" => {
                let charge: Charge = parse_object(event)?;
                let payment_ref = charge.payment_intent.as_deref().unwrap_or(&charge.id);
                let order = self
                    .stripe_order_by_ref(metadata_order_id(&charge.metadata), payment_ref)
                    .await?;
                let update = self.refund(&order.id).await?;
                outcome_of(&update, IntakeOutcome::Refunded)
            }
            other => {
                tracing::debug!(event_type = %other, "Unhandled Stripe event type");
                IntakeOutcome::Ignored
            }
        };

        Ok(outcome)
    }

    async fn stripe_order_for_session(
        &self,
        session: &CheckoutSession,
    ) -> Result<PaymentOrder, ApiError> {
        if let Some(order) = self.stripe_order_by_id(session.order_id()).await? {
            return Ok(order);
        }
        match self
            .store
            .find_payment_order(PaymentProvider::Stripe, &session.id)
            .await?
        {
            Some(order) => Ok(order),
            None => Err(order_not_found(&session.id)),
        }
    }

    async fn stripe_order_by_ref(
        &self,
        order_id: Option<&str>,
        payment_ref: &str,
    ) -> Result<PaymentOrder, ApiError> {
        if let Some(order) = self.stripe_order_by_id(order_id).await? {
            return Ok(order);
        }
        match self
            .store
            .find_payment_order_by_payment_ref(PaymentProvider::Stripe, payment_ref)
            .await?
        {
            Some(order) => Ok(order),
            None => Err(order_not_found(payment_ref)),
        }
    }

    async fn stripe_order_by_id(&self, order_id: Option<&str>) -> Result<Option<PaymentOrder>, ApiError> {
        let Some(id) = order_id.and_then(|s| s.parse::<PaymentOrderId>().ok()) else {
            return Ok(None);
        };
        Ok(self
            .store
            .get_payment_order(&id)
            .await?
            .filter(|o| o.provider == PaymentProvider::Stripe))
    }

    // =========================================================================
    // Shopier
    // =========================================================================

    /// Verify and handle a Shopier OSB callback.
    ///
    /// # Errors
    ///
    /// - `NotConfigured` without OSB credentials.
    /// - `SignatureInvalid` if the credentials do not match; nothing changes.
    /// - `NotFound` for an unknown `platform_order_id`.
    pub async fn handle_shopier_osb(
        &self,
        notification: &OsbNotification,
    ) -> Result<IntakeOutcome, ApiError> {
        let shopier = self
            .shopier
            .as_ref()
            .filter(|s| s.accepts_osb())
            .ok_or_else(|| ApiError::NotConfigured("Shopier OSB not configured".into()))?;

        if !shopier.verify_osb(notification) {
            tracing::warn!(
                platform_order_id = %notification.platform_order_id,
                "Shopier OSB credentials rejected"
            );
            return Err(ApiError::SignatureInvalid);
        }

        let order = self
            .store
            .find_payment_order(PaymentProvider::Shopier, &notification.platform_order_id)
            .await?
            .ok_or_else(|| order_not_found(&notification.platform_order_id))?;

        tracing::info!(
            order_id = %order.id,
            status = %notification.status,
            payment_status = %notification.payment_status,
            "Shopier OSB received"
        );

        if notification.is_paid() {
            Ok(settled(&self.settle(&order.id, None).await?))
        } else if notification.is_failed() {
            let update = self.fail(&order.id, "Shopier reported payment failure").await?;
            Ok(outcome_of(&update, IntakeOutcome::Failed))
        } else {
            Ok(IntakeOutcome::Ignored)
        }
    }
}

fn parse_object<T: serde::de::DeserializeOwned>(event: &WebhookEvent) -> Result<T, ApiError> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| {
        ApiError::BadRequest(format!("Invalid {} object: {e}", event.event_type))
    })
}

fn order_not_found(reference: &str) -> ApiError {
    tracing::error!(reference = %reference, "Payment notification for unknown order");
    BillingError::OrderNotFound {
        order_id: reference.to_string(),
    }
    .into()
}

fn outcome_of(update: &OrderUpdate, applied: IntakeOutcome) -> IntakeOutcome {
    match update.transition {
        Transition::Apply => applied,
        Transition::AlreadyApplied => IntakeOutcome::Duplicate,
        Transition::Rejected => IntakeOutcome::Rejected,
    }
}

fn settled(update: &OrderUpdate) -> IntakeOutcome {
    outcome_of(update, IntakeOutcome::Settled)
}

fn log_transition(update: &OrderUpdate, to: &str) {
    match update.transition {
        Transition::Apply => tracing::info!(
            order_id = %update.order.id,
            status = %update.order.status,
            "Payment order updated"
        ),
        Transition::AlreadyApplied => tracing::info!(
            order_id = %update.order.id,
            status = %update.order.status,
            "Duplicate notification ignored"
        ),
        Transition::Rejected => tracing::warn!(
            order_id = %update.order.id,
            status = %update.order.status,
            requested = to,
            "Stale transition rejected"
        ),
    }
}
