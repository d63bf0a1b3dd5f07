//! Credit Guard: the sanctioned way to move credits.
//!
//! Thin layer over the [`Store`] primitives that turns a refused deduction
//! into `InsufficientCredits` and logs every balance change.

use std::sync::Arc;

use creditline_core::{AccountId, BalanceAudit, BillingError, LedgerEntry, Result};
use creditline_store::Store;

/// Atomic credit primitives for one store.
#[derive(Clone)]
pub struct CreditGuard {
    store: Arc<dyn Store>,
}

impl CreditGuard {
    /// Create a guard over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Deduct `amount` if the balance covers it.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientCredits` (with the current balance) when the
    /// balance is too low, `AccountNotFound` for an unknown account.
    pub async fn deduct(
        &self,
        account_id: &AccountId,
        amount: i64,
        reason: &str,
    ) -> Result<LedgerEntry> {
        if let Some(entry) = self.store.deduct(account_id, amount, reason).await? {
            tracing::info!(
                account_id = %account_id,
                amount,
                balance = entry.balance_after,
                reason,
                "Credits deducted"
            );
            return Ok(entry);
        }
        Err(self.insufficient(account_id, amount).await)
    }

    /// Grant `amount` credits.
    ///
    /// # Errors
    ///
    /// Returns `AccountNotFound` for an unknown account.
    pub async fn add(&self, account_id: &AccountId, amount: i64, reason: &str) -> Result<LedgerEntry> {
        let entry = self.store.add(account_id, amount, reason).await?;
        tracing::info!(
            account_id = %account_id,
            amount,
            balance = entry.balance_after,
            reason,
            "Credits granted"
        );
        Ok(entry)
    }

    /// Return `amount` credits after failed work.
    ///
    /// # Errors
    ///
    /// Returns `AccountNotFound` for an unknown account.
    pub async fn refund(
        &self,
        account_id: &AccountId,
        amount: i64,
        reason: &str,
    ) -> Result<LedgerEntry> {
        let entry = self.store.refund(account_id, amount, reason).await?;
        tracing::info!(
            account_id = %account_id,
            amount,
            balance = entry.balance_after,
            reason,
            "Credits refunded"
        );
        Ok(entry)
    }

    /// Compare the stored balance with the one rebuilt from the ledger.
    ///
    /// # Errors
    ///
    /// Returns `AccountNotFound` for an unknown account.
    pub async fn audit(&self, account_id: &AccountId) -> Result<BalanceAudit> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| BillingError::AccountNotFound {
                account_id: account_id.to_string(),
            })?;
        let entries = self.store.ledger_for_account(account_id).await?;
        let audit = BalanceAudit::run(account.balance, account.opening_balance, &entries);
        if !audit.consistent {
            tracing::error!(
                account_id = %account_id,
                balance = audit.balance,
                reconstructed = audit.reconstructed,
                "Balance does not match ledger"
            );
        }
        Ok(audit)
    }

    /// Build the `InsufficientCredits` error for a refused deduction.
    pub(crate) async fn insufficient(&self, account_id: &AccountId, required: i64) -> BillingError {
        match self.store.get_account(account_id).await {
            Ok(Some(account)) => {
                tracing::info!(
                    account_id = %account_id,
                    balance = account.balance,
                    required,
                    "Insufficient credits"
                );
                BillingError::InsufficientCredits {
                    balance: account.balance,
                    required,
                }
            }
            Ok(None) => BillingError::AccountNotFound {
                account_id: account_id.to_string(),
            },
            Err(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creditline_core::Account;
    use creditline_store::MemoryStore;

    async fn guard_with_balance(balance: i64) -> (CreditGuard, AccountId) {
        let store = Arc::new(MemoryStore::new());
        let id = AccountId::generate();
        store.create_account(&Account::new(id, None)).await.unwrap();
        let guard = CreditGuard::new(store);
        if balance > 0 {
            guard.add(&id, balance, "seed").await.unwrap();
        }
        (guard, id)
    }

    #[tokio::test]
    async fn refused_deduct_reports_balance() {
        let (guard, id) = guard_with_balance(10).await;
        let err = guard.deduct(&id, 30, "job").await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::InsufficientCredits {
                balance: 10,
                required: 30
            }
        ));
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let (guard, _) = guard_with_balance(0).await;
        let err = guard.add(&AccountId::generate(), 5, "x").await.unwrap_err();
        assert!(matches!(err, BillingError::AccountNotFound { .. }));
    }

    #[tokio::test]
    async fn audit_is_consistent_after_mixed_operations() {
        let (guard, id) = guard_with_balance(100).await;
        guard.deduct(&id, 30, "job").await.unwrap();
        guard.refund(&id, 30, "refund: job").await.unwrap();
        guard.deduct(&id, 45, "job 2").await.unwrap();

        let audit = guard.audit(&id).await.unwrap();
        assert!(audit.consistent);
        assert_eq!(audit.balance, 55);
        assert_eq!(audit.entries, 4);
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected() {
        let (guard, id) = guard_with_balance(10).await;
        let err = guard.add(&id, 0, "zero").await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidAmount(_)));
    }
}
