//! Referral types for creditline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AccountId, BillingError, LedgerEntry, ReferralId};

/// Length of a referral code.
pub const REFERRAL_CODE_LEN: usize = 8;

/// Alphabet referral codes are drawn from.
pub const REFERRAL_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Default bonus for the account whose code was redeemed.
pub const DEFAULT_REFERRER_BONUS: i64 = 50;

/// Default bonus for the account redeeming a code.
pub const DEFAULT_REFERRED_BONUS: i64 = 20;

/// Canonical form of a user-supplied code.
#[must_use]
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Whether `code` (already normalized) has the shape of a referral code.
#[must_use]
pub fn is_well_formed(code: &str) -> bool {
    code.len() == REFERRAL_CODE_LEN && code.bytes().all(|b| REFERRAL_CODE_ALPHABET.contains(&b))
}

/// Bonus amounts paid on a redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralBonus {
    /// Credits for the code owner.
    pub referrer: i64,
    /// Credits for the redeeming account.
    pub referred: i64,
}

impl Default for ReferralBonus {
    fn default() -> Self {
        Self {
            referrer: DEFAULT_REFERRER_BONUS,
            referred: DEFAULT_REFERRED_BONUS,
        }
    }
}

/// One redemption. An account appears as `referred_id` at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralEvent {
    /// Event ID.
    pub id: ReferralId,
    /// Owner of the redeemed code.
    pub referrer_id: AccountId,
    /// Account that redeemed the code.
    pub referred_id: AccountId,
    /// The code as stored.
    pub code: String,
    /// Credits paid to the referrer.
    pub referrer_bonus: i64,
    /// Credits paid to the referred account.
    pub referred_bonus: i64,
    /// When the code was redeemed.
    pub created_at: DateTime<Utc>,
}

impl ReferralEvent {
    /// Create an event for a redemption about to be committed.
    #[must_use]
    pub fn new(
        referrer_id: AccountId,
        referred_id: AccountId,
        code: String,
        bonus: ReferralBonus,
    ) -> Self {
        Self {
            id: ReferralId::generate(),
            referrer_id,
            referred_id,
            code,
            referrer_bonus: bonus.referrer,
            referred_bonus: bonus.referred,
            created_at: Utc::now(),
        }
    }

    /// Ledger reason for the referrer's bonus.
    #[must_use]
    pub fn referrer_reason(&self) -> String {
        format!("referral bonus: code {} redeemed by {}", self.code, self.referred_id)
    }

    /// Ledger reason for the referred account's bonus.
    #[must_use]
    pub fn referred_reason(&self) -> String {
        format!("referral bonus: redeemed code {} of {}", self.code, self.referrer_id)
    }
}

/// Result of a referral redemption attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferralOutcome {
    /// The referral was recorded and the non-zero bonuses credited.
    Applied {
        /// The recorded event.
        event: ReferralEvent,
        /// Ledger entry of the referrer's bonus, `None` for a zero bonus.
        referrer_entry: Option<LedgerEntry>,
        /// Ledger entry of the referred account's bonus, `None` for a zero
        /// bonus.
        referred_entry: Option<LedgerEntry>,
    },
    /// The redeeming account was already referred.
    AlreadyReferred,
    /// No account owns the code.
    InvalidCode,
    /// The code belongs to the redeeming account.
    SelfReferral,
}

impl ReferralOutcome {
    /// Convert a refusal into its domain error.
    ///
    /// # Errors
    ///
    /// Returns the matching `BillingError` for every outcome but `Applied`.
    pub fn into_result(self, code: &str) -> crate::Result<ReferralEvent> {
        match self {
            Self::Applied { event, .. } => Ok(event),
            Self::AlreadyReferred => Err(BillingError::AlreadyReferred),
            Self::SelfReferral => Err(BillingError::SelfReferral),
            Self::InvalidCode => Err(BillingError::InvalidReferralCode {
                code: code.to_string(),
            }),
        }
    }
}

/// Referral totals for one referrer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralStats {
    /// Accounts that redeemed this account's code.
    pub referral_count: u64,
    /// Credits earned from those redemptions.
    pub total_bonus_earned: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_normalized_to_uppercase() {
        assert_eq!(normalize_code("  ab12cd34 "), "AB12CD34");
        assert!(is_well_formed(&normalize_code("ab12cd34")));
        assert!(!is_well_formed("AB12"));
        assert!(!is_well_formed("AB12CD3!"));
    }

    #[test]
    fn refusals_map_to_errors() {
        assert!(matches!(
            ReferralOutcome::AlreadyReferred.into_result("X"),
            Err(BillingError::AlreadyReferred)
        ));
        assert!(matches!(
            ReferralOutcome::InvalidCode.into_result("NOPE1234"),
            Err(BillingError::InvalidReferralCode { code }) if code == "NOPE1234"
        ));
    }
}
