//! Payment orders for creditline.
//!
//! A [`PaymentOrder`] is created when checkout starts and is settled by the
//! provider's server-to-server notification. The provider-assigned
//! `external_order_id` is the idempotency key. `Success`, `Failed` and
//! `Refunded` are terminal: a later, possibly stale, event never moves an
//! order out of them except `Success -> Refunded`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{AccountId, CreditPackage, PaymentOrderId, Transition};

/// Credits granted for `credits` with a `bonus_percent` bonus, rounded down.
#[must_use]
pub fn granted_credits(credits: i64, bonus_percent: i64) -> i64 {
    credits * (100 + bonus_percent) / 100
}

/// Payment provider that owns an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentProvider {
    /// Stripe Checkout.
    Stripe,
    /// Shopier hosted payment page.
    Shopier,
}

impl PaymentProvider {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::Shopier => "shopier",
        }
    }
}

impl fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stripe" => Ok(Self::Stripe),
            "shopier" => Ok(Self::Shopier),
            other => Err(format!("unknown payment provider: {other}")),
        }
    }
}

/// Lifecycle of a payment order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Checkout started, no notification yet.
    Pending,
    /// Provider reported the payment as in flight.
    Processing,
    /// Credits granted.
    Success,
    /// Payment failed. No credits were granted.
    Failed,
    /// Payment was refunded and the grant reversed.
    Refunded,
}

impl OrderStatus {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    /// Whether the status is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Refunded)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// A credit purchase awaiting or past settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOrder {
    /// Internal order ID, sent to the provider as correlation metadata.
    pub id: PaymentOrderId,

    /// The purchasing account.
    pub account_id: AccountId,

    /// Provider handling the payment.
    pub provider: PaymentProvider,

    /// Provider-side order id (Stripe session id, Shopier merchant order id).
    pub external_order_id: String,

    /// Provider payment reference (Stripe payment intent), once known.
    pub payment_ref: Option<String>,

    /// Package purchased.
    pub package_id: String,

    /// Credits before bonus.
    pub credits_requested: i64,

    /// Bonus percentage applied on settlement.
    pub bonus_percent: i64,

    /// Charged price in the currency's minor unit.
    pub price_minor: i64,

    /// ISO 4217 currency code, lowercase.
    pub currency: String,

    /// Current status.
    pub status: OrderStatus,

    /// Provider error text for failed orders.
    pub error_message: Option<String>,

    /// When checkout started.
    pub created_at: DateTime<Utc>,

    /// When the order reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentOrder {
    /// Create a pending order for `package`.
    #[must_use]
    pub fn new(
        id: PaymentOrderId,
        account_id: AccountId,
        provider: PaymentProvider,
        external_order_id: String,
        package: &CreditPackage,
    ) -> Self {
        Self {
            id,
            account_id,
            provider,
            external_order_id,
            payment_ref: None,
            package_id: package.id.clone(),
            credits_requested: package.credits,
            bonus_percent: package.bonus_percent,
            price_minor: package.price_minor,
            currency: package.currency.clone(),
            status: OrderStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Credits this order grants on settlement.
    #[must_use]
    pub fn credits_granted(&self) -> i64 {
        granted_credits(self.credits_requested, self.bonus_percent)
    }

    /// Ledger reason for the settlement grant.
    #[must_use]
    pub fn grant_reason(&self) -> String {
        format!(
            "{} order {}: {} credits (+{}% bonus, package {})",
            self.provider, self.id, self.credits_requested, self.bonus_percent, self.package_id
        )
    }

    /// Ledger reason for the reversal of a refunded order.
    #[must_use]
    pub fn reversal_reason(&self) -> String {
        format!("{} order {} refunded", self.provider, self.id)
    }

    /// Check a move to `Success`. A refunded order has already been granted.
    #[must_use]
    pub const fn settle_check(&self) -> Transition {
        match self.status {
            OrderStatus::Pending | OrderStatus::Processing => Transition::Apply,
            OrderStatus::Success | OrderStatus::Refunded => Transition::AlreadyApplied,
            OrderStatus::Failed => Transition::Rejected,
        }
    }

    /// Check a move to `Processing`.
    #[must_use]
    pub const fn processing_check(&self) -> Transition {
        match self.status {
            OrderStatus::Pending => Transition::Apply,
            OrderStatus::Processing => Transition::AlreadyApplied,
            OrderStatus::Success | OrderStatus::Failed | OrderStatus::Refunded => {
                Transition::Rejected
            }
        }
    }

    /// Check a move to `Failed`.
    #[must_use]
    pub const fn fail_check(&self) -> Transition {
        match self.status {
            OrderStatus::Pending | OrderStatus::Processing => Transition::Apply,
            OrderStatus::Failed => Transition::AlreadyApplied,
            OrderStatus::Success | OrderStatus::Refunded => Transition::Rejected,
        }
    }

    /// Check a move to `Refunded`. Only settled orders can be refunded.
    #[must_use]
    pub const fn refund_check(&self) -> Transition {
        match self.status {
            OrderStatus::Success => Transition::Apply,
            OrderStatus::Refunded => Transition::AlreadyApplied,
            OrderStatus::Pending | OrderStatus::Processing | OrderStatus::Failed => {
                Transition::Rejected
            }
        }
    }
}
