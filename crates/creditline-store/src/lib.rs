//! Storage layer for creditline.
//!
//! The [`Store`] trait is the only way balances change. Each compound method
//! is one atomic unit: the balance update, its ledger entry and any status
//! change commit together or not at all.
//!
//! Three backends implement it:
//!
//! - [`PgStore`]: PostgreSQL via `sqlx`. Deductions are a single conditional
//!   `UPDATE ... WHERE balance >= $amount`; compound operations run in one
//!   transaction with the order/job row locked `FOR UPDATE`.
//! - [`MemoryStore`]: process-local, every operation under one lock.
//! - `RocksStore` (feature `rocksdb-backend`): embedded `RocksDB` with CBOR
//!   values; every compound operation is one `WriteBatch` under a write lock.
//!
//! # Example
//!
//! ```no_run
//! use creditline_core::{Account, AccountId};
//! use creditline_store::{MemoryStore, Store};
//!
//! # async fn demo() -> creditline_store::Result<()> {
//! let store = MemoryStore::new();
//! let id = AccountId::generate();
//! store.create_account(&Account::new(id, None)).await?;
//!
//! store.add(&id, 100, "welcome").await?;
//! let hold = store.deduct(&id, 30, "job").await?;
//! assert!(hold.is_some());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
#[cfg(feature = "rocksdb-backend")]
pub mod keys;
pub mod memory;
pub mod postgres;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
#[cfg(feature = "rocksdb-backend")]
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use std::collections::HashMap;

use async_trait::async_trait;
use creditline_core::{
    Account, AccountId, GenerationJob, JobId, LedgerEntry, PaymentOrder, PaymentOrderId,
    PaymentProvider, ReferralBonus, ReferralEvent, ReferralOutcome, ReferralStats, Transition,
};

/// Result of a payment order status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderUpdate {
    /// The order after the call.
    pub order: PaymentOrder,
    /// What happened.
    pub transition: Transition,
    /// Ledger entry written by the change, if it moved credits.
    pub entry: Option<LedgerEntry>,
}

/// Result of a job status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUpdate {
    /// The job after the call.
    pub job: GenerationJob,
    /// What happened.
    pub transition: Transition,
    /// Ledger entry written by the change (the refund of a failed job).
    pub entry: Option<LedgerEntry>,
}

/// Reject non-positive credit amounts.
///
/// # Errors
///
/// Returns `StoreError::InvalidAmount` if `amount <= 0`.
pub fn ensure_positive(amount: i64) -> Result<()> {
    if amount > 0 {
        Ok(())
    } else {
        Err(StoreError::InvalidAmount(amount))
    }
}

/// Reject negative bonuses. A zero bonus is valid and writes no ledger entry.
///
/// # Errors
///
/// Returns `StoreError::InvalidAmount` if `amount < 0`.
pub fn ensure_non_negative(amount: i64) -> Result<()> {
    if amount < 0 {
        Err(StoreError::InvalidAmount(amount))
    } else {
        Ok(())
    }
}

/// [`ensure_non_negative`] for both halves of a referral bonus.
///
/// # Errors
///
/// Returns `StoreError::InvalidAmount` with the first negative bonus.
pub fn ensure_bonus(bonus: ReferralBonus) -> Result<()> {
    ensure_non_negative(bonus.referrer)?;
    ensure_non_negative(bonus.referred)
}

/// The storage trait defining all database operations.
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Account Operations
    // =========================================================================

    /// Insert an account if none exists with its id.
    ///
    /// Returns `false` if the account already existed (nothing is written).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn create_account(&self, account: &Account) -> Result<bool>;

    /// Insert an account and grant its signup bonus as one unit.
    ///
    /// Returns the stored account, or `None` if it already existed (nothing
    /// is written). A zero bonus writes no ledger entry.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidAmount` for a negative bonus or one that
    /// would overflow the balance, or an error if the database operation
    /// fails. Nothing is written in either case.
    async fn open_account(
        &self,
        account: &Account,
        signup_bonus: i64,
        reason: &str,
    ) -> Result<Option<Account>>;

    /// Get an account by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>>;

    /// Find the account owning a referral code (already normalized).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_account_by_referral_code(&self, code: &str) -> Result<Option<Account>>;

    /// Give an account a referral code unless it already has one.
    ///
    /// Returns the account's code after the call, or `None` if `code` is
    /// already owned by another account.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the account doesn't exist.
    async fn assign_referral_code(&self, id: &AccountId, code: &str) -> Result<Option<String>>;

    // =========================================================================
    // Credit Guard
    // =========================================================================

    /// Remove `amount` credits if the balance covers it, and record it.
    ///
    /// Returns `None` when the balance is insufficient; nothing is written.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the account doesn't exist.
    /// - `StoreError::InvalidAmount` if `amount <= 0`.
    async fn deduct(&self, id: &AccountId, amount: i64, reason: &str)
        -> Result<Option<LedgerEntry>>;

    /// Grant `amount` credits and record it.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the account doesn't exist.
    /// - `StoreError::InvalidAmount` if `amount <= 0`.
    async fn add(&self, id: &AccountId, amount: i64, reason: &str) -> Result<LedgerEntry>;

    /// Return `amount` previously held credits and record the refund.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the account doesn't exist.
    /// - `StoreError::InvalidAmount` if `amount <= 0`.
    async fn refund(&self, id: &AccountId, amount: i64, reason: &str) -> Result<LedgerEntry>;

    // =========================================================================
    // Ledger
    // =========================================================================

    /// List ledger entries for an account, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_ledger(
        &self,
        id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>>;

    /// Every ledger entry of an account, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn ledger_for_account(&self, id: &AccountId) -> Result<Vec<LedgerEntry>>;

    // =========================================================================
    // Payment Orders
    // =========================================================================

    /// Persist a new pending order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the provider's order id is taken.
    async fn create_payment_order(&self, order: &PaymentOrder) -> Result<()>;

    /// Get an order by its internal id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_payment_order(&self, id: &PaymentOrderId) -> Result<Option<PaymentOrder>>;

    /// Find an order by the provider-assigned order id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_payment_order(
        &self,
        provider: PaymentProvider,
        external_order_id: &str,
    ) -> Result<Option<PaymentOrder>>;

    /// Find an order by its provider payment reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_payment_order_by_payment_ref(
        &self,
        provider: PaymentProvider,
        payment_ref: &str,
    ) -> Result<Option<PaymentOrder>>;

    /// List orders of an account, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_payment_orders(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PaymentOrder>>;

    /// Move an order to `processing`, recording the payment reference.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the order doesn't exist.
    async fn mark_payment_processing(
        &self,
        id: &PaymentOrderId,
        payment_ref: Option<&str>,
    ) -> Result<OrderUpdate>;

    /// Settle an order: grant its credits, record the grant and mark it
    /// `success`, all at once. A settled or refunded order is left alone.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the order or its account doesn't exist.
    async fn settle_payment_order(
        &self,
        id: &PaymentOrderId,
        payment_ref: Option<&str>,
    ) -> Result<OrderUpdate>;

    /// Mark a non-terminal order `failed`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the order doesn't exist.
    async fn fail_payment_order(&self, id: &PaymentOrderId, error: &str) -> Result<OrderUpdate>;

    /// Mark a settled order `refunded` and reverse its grant, clamped so the
    /// balance does not go below zero.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the order or its account doesn't exist.
    async fn refund_payment_order(&self, id: &PaymentOrderId) -> Result<OrderUpdate>;

    // =========================================================================
    // Generation Jobs
    // =========================================================================

    /// Hold credits for `jobs` and persist them, all at once.
    ///
    /// All jobs must belong to the same account. The sum of their costs is
    /// deducted in one conditional update recorded by one ledger entry.
    /// Returns `None` when the balance is insufficient; no job is written.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the account doesn't exist.
    /// - `StoreError::InvalidAmount` if the total is not positive.
    async fn create_jobs(&self, jobs: &[GenerationJob], reason: &str)
        -> Result<Option<LedgerEntry>>;

    /// Get a job by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_job(&self, id: &JobId) -> Result<Option<GenerationJob>>;

    /// Find a job by its provider task id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn find_job_by_task_id(&self, task_id: &str) -> Result<Option<GenerationJob>>;

    /// List jobs of an account, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_jobs(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<GenerationJob>>;

    /// Jobs still `pending` or `processing`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_active_jobs(&self, limit: usize) -> Result<Vec<GenerationJob>>;

    /// Record the provider task id of an in-flight job.
    ///
    /// Terminal jobs are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the job doesn't exist.
    async fn attach_task_id(&self, id: &JobId, task_id: &str) -> Result<GenerationJob>;

    /// Mark a job `completed` with its result. No credits move.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the job doesn't exist.
    async fn complete_job(&self, id: &JobId, result_url: &str) -> Result<JobUpdate>;

    /// Mark a job `failed` and refund its held credits. Only the first
    /// transition into `failed` refunds.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the job or its account doesn't exist.
    async fn fail_job(&self, id: &JobId, error: &str) -> Result<JobUpdate>;

    /// Mark a job `cancelled`. No credits move.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the job doesn't exist.
    async fn cancel_job(&self, id: &JobId, reason: &str) -> Result<JobUpdate>;

    // =========================================================================
    // Referrals
    // =========================================================================

    /// Redeem a referral code for `referred`: set its referrer once, credit
    /// both accounts, record both grants and the event, all at once. A zero
    /// bonus still records the referral but writes no grant.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the redeeming account doesn't exist,
    /// `StoreError::InvalidAmount` for a negative bonus or one that would
    /// overflow a balance. Nothing is written in either case.
    async fn apply_referral(
        &self,
        referred: &AccountId,
        code: &str,
        bonus: ReferralBonus,
    ) -> Result<ReferralOutcome>;

    /// Totals for a referrer.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn referral_stats(&self, referrer: &AccountId) -> Result<ReferralStats>;

    /// Redemptions of a referrer's code, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_referrals(&self, referrer: &AccountId) -> Result<Vec<ReferralEvent>>;

    // =========================================================================
    // Settings
    // =========================================================================

    /// All runtime settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_settings(&self) -> Result<HashMap<String, String>>;

    /// Insert or replace one runtime setting.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn put_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// Total hold for a set of jobs, checking they share one account.
///
/// # Errors
///
/// - `StoreError::Conflict` if the jobs span several accounts or none.
/// - `StoreError::InvalidAmount` if the total is not positive.
pub fn batch_hold(jobs: &[GenerationJob]) -> Result<(AccountId, i64)> {
    let Some(first) = jobs.first() else {
        return Err(StoreError::Conflict("no jobs to create".into()));
    };
    if jobs.iter().any(|j| j.account_id != first.account_id) {
        return Err(StoreError::Conflict("jobs span several accounts".into()));
    }
    let total = jobs.iter().map(|j| j.credit_cost).sum();
    ensure_positive(total)?;
    Ok((first.account_id, total))
}
