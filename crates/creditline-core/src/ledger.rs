//! Ledger entries for creditline.
//!
//! Every balance change produces exactly one [`LedgerEntry`]. Entries are
//! immutable and carry the balance before and after the change, so the live
//! balance can always be checked against the sum of the history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{AccountId, LedgerEntryId};

/// Prefix of the reason recorded on compensating refunds.
pub const REFUND_REASON_PREFIX: &str = "refund: ";

/// Kind of balance change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Credits added (purchase, bonus, admin grant).
    Grant,
    /// Credits removed (job hold, payment reversal, admin deduction).
    Deduct,
    /// Credits returned after a failed job.
    Refund,
}

impl EntryKind {
    /// Stable lowercase name, used as the storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Deduct => "deduct",
            Self::Refund => "refund",
        }
    }

    /// Apply this kind's sign to a positive amount.
    #[must_use]
    pub const fn signed(&self, amount: i64) -> i64 {
        match self {
            Self::Grant | Self::Refund => amount,
            Self::Deduct => -amount,
        }
    }

    /// The balance after applying `amount` to `balance`, or `None` if it
    /// leaves the `i64` range.
    #[must_use]
    pub const fn apply(&self, balance: i64, amount: i64) -> Option<i64> {
        match self {
            Self::Grant | Self::Refund => balance.checked_add(amount),
            Self::Deduct => balance.checked_sub(amount),
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grant" => Ok(Self::Grant),
            "deduct" => Ok(Self::Deduct),
            "refund" => Ok(Self::Refund),
            other => Err(format!("unknown ledger entry kind: {other}")),
        }
    }
}

/// One immutable record of a balance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry ID (ULID, time-ordered).
    pub id: LedgerEntryId,

    /// The account whose balance changed.
    pub account_id: AccountId,

    /// Kind of change.
    pub kind: EntryKind,

    /// Magnitude of the change. Always positive.
    pub amount: i64,

    /// Free text naming the cause (order id, job id, admin note).
    pub reason: String,

    /// Balance immediately before the change.
    pub balance_before: i64,

    /// Balance immediately after the change.
    pub balance_after: i64,

    /// When the change happened.
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Record a grant of `amount` on top of `balance_before`.
    #[must_use]
    pub fn grant(
        account_id: AccountId,
        amount: i64,
        balance_before: i64,
        reason: String,
    ) -> Option<Self> {
        Self::new(account_id, EntryKind::Grant, amount, balance_before, reason)
    }

    /// Record a deduction of `amount` from `balance_before`.
    #[must_use]
    pub fn deduct(
        account_id: AccountId,
        amount: i64,
        balance_before: i64,
        reason: String,
    ) -> Option<Self> {
        Self::new(account_id, EntryKind::Deduct, amount, balance_before, reason)
    }

    /// Record a compensating refund of `amount` on top of `balance_before`.
    #[must_use]
    pub fn refund(
        account_id: AccountId,
        amount: i64,
        balance_before: i64,
        reason: String,
    ) -> Option<Self> {
        Self::new(account_id, EntryKind::Refund, amount, balance_before, reason)
    }

    /// Record a change of any kind. `None` if the resulting balance would
    /// overflow.
    #[must_use]
    pub fn new(
        account_id: AccountId,
        kind: EntryKind,
        amount: i64,
        balance_before: i64,
        reason: String,
    ) -> Option<Self> {
        Some(Self {
            id: LedgerEntryId::generate(),
            account_id,
            kind,
            amount,
            reason,
            balance_before,
            balance_after: kind.apply(balance_before, amount)?,
            created_at: Utc::now(),
        })
    }

    /// The change as a signed delta: positive for grants and refunds.
    #[must_use]
    pub const fn signed_amount(&self) -> i64 {
        self.kind.signed(self.amount)
    }

    /// Whether `balance_after` follows from `balance_before` and the amount.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.amount > 0
            && matches!(self.kind.apply(self.balance_before, self.amount), Some(after) if after == self.balance_after)
    }
}

/// Reason recorded on the compensating refund for `cause`.
#[must_use]
pub fn refund_reason(cause: &str) -> String {
    format!("{REFUND_REASON_PREFIX}{cause}")
}

/// Replay a ledger history on top of the opening balance.
#[must_use]
pub fn reconstruct_balance<'a>(
    opening_balance: i64,
    entries: impl IntoIterator<Item = &'a LedgerEntry>,
) -> i64 {
    entries
        .into_iter()
        .fold(opening_balance, |balance, entry| {
            balance.saturating_add(entry.signed_amount())
        })
}

/// Result of checking a live balance against its ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceAudit {
    /// The balance stored on the account.
    pub balance: i64,
    /// The balance replayed from the ledger.
    pub reconstructed: i64,
    /// Number of entries replayed.
    pub entries: usize,
    /// Whether both agree and every entry is internally consistent.
    pub consistent: bool,
}

impl BalanceAudit {
    /// Audit `balance` against `entries` (any order).
    #[must_use]
    pub fn run(balance: i64, opening_balance: i64, entries: &[LedgerEntry]) -> Self {
        let reconstructed = reconstruct_balance(opening_balance, entries);
        let entries_ok = entries.iter().all(LedgerEntry::is_consistent);
        Self {
            balance,
            reconstructed,
            entries: entries.len(),
            consistent: entries_ok && reconstructed == balance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_compute_balance_after() {
        let account = AccountId::generate();
        let grant = LedgerEntry::grant(account, 50, 100, "bonus".into()).unwrap();
        let deduct = LedgerEntry::deduct(account, 30, 150, "job".into()).unwrap();
        let refund = LedgerEntry::refund(account, 30, 120, refund_reason("job")).unwrap();

        assert_eq!(grant.balance_after, 150);
        assert_eq!(deduct.balance_after, 120);
        assert_eq!(refund.balance_after, 150);
        assert_eq!(refund.reason, "refund: job");
        assert!(grant.is_consistent() && deduct.is_consistent() && refund.is_consistent());
    }

    #[test]
    fn overflowing_change_has_no_entry() {
        let account = AccountId::generate();
        assert!(LedgerEntry::grant(account, 1, i64::MAX, "x".into()).is_none());
        assert!(LedgerEntry::deduct(account, 2, i64::MIN + 1, "x".into()).is_none());
        assert_eq!(EntryKind::Refund.apply(i64::MAX - 1, 1), Some(i64::MAX));
    }

    #[test]
    fn tampered_entry_is_inconsistent() {
        let mut entry = LedgerEntry::grant(AccountId::generate(), 10, 0, "x".into()).unwrap();
        entry.balance_after = 11;
        assert!(!entry.is_consistent());
    }

    #[test]
    fn reconstructs_compensated_job() {
        let account = AccountId::generate();
        let entries = vec![
            LedgerEntry::deduct(account, 30, 100, "job J1".into()).unwrap(),
            LedgerEntry::refund(account, 30, 70, refund_reason("job J1")).unwrap(),
        ];
        assert_eq!(reconstruct_balance(100, &entries), 100);

        let audit = BalanceAudit::run(100, 100, &entries);
        assert!(audit.consistent);
        assert_eq!(audit.entries, 2);
    }

    #[test]
    fn audit_flags_drift() {
        let account = AccountId::generate();
        let entries = vec![LedgerEntry::grant(account, 25, 0, "signup".into()).unwrap()];
        let audit = BalanceAudit::run(30, 0, &entries);
        assert_eq!(audit.reconstructed, 25);
        assert!(!audit.consistent);
    }

    #[test]
    fn entry_kind_parses_its_own_name() {
        for kind in [EntryKind::Grant, EntryKind::Deduct, EntryKind::Refund] {
            assert_eq!(kind.as_str().parse::<EntryKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<EntryKind>().is_err());
    }
}
