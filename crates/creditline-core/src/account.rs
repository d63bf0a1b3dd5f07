//! Account types for creditline.
//!
//! An account carries the spendable balance. The balance is only ever changed
//! through the store's credit primitives, each of which appends one ledger
//! entry in the same atomic unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AccountId;

/// A credit account for a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// The account ID (JWT subject).
    pub id: AccountId,

    /// Contact email, if known.
    pub email: Option<String>,

    /// Current credit balance. Never negative.
    pub balance: i64,

    /// Balance the account was created with, before any ledger entry.
    pub opening_balance: i64,

    /// This account's own referral code, assigned on first request.
    pub referral_code: Option<String>,

    /// The account whose code this account redeemed. Set at most once.
    pub referred_by: Option<AccountId>,

    /// When the account was created.
    pub created_at: DateTime<Utc>,

    /// When the account was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account with zero balance.
    #[must_use]
    pub fn new(id: AccountId, email: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            email,
            balance: 0,
            opening_balance: 0,
            referral_code: None,
            referred_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the account has sufficient credits for a deduction.
    #[must_use]
    pub fn has_sufficient_credits(&self, amount: i64) -> bool {
        self.balance >= amount
    }

    /// Whether this account has already redeemed a referral code.
    #[must_use]
    pub fn is_referred(&self) -> bool {
        self.referred_by.is_some()
    }
}
