//! In-memory storage implementation.
//!
//! Every operation runs under one lock, so each compound operation is atomic
//! with respect to every other. Used by tests and single-node development.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use creditline_core::{
    Account, AccountId, EntryKind, GenerationJob, JobId, JobStatus, LedgerEntry, OrderStatus,
    PaymentOrder, PaymentOrderId, PaymentProvider, ReferralBonus, ReferralEvent, ReferralOutcome,
    ReferralStats, Transition,
};

use crate::error::{Result, StoreError};
use crate::{
    batch_hold, ensure_bonus, ensure_non_negative, ensure_positive, JobUpdate, OrderUpdate, Store,
};

#[derive(Default)]
struct Inner {
    accounts: HashMap<AccountId, Account>,
    ledger: Vec<LedgerEntry>,
    orders: HashMap<PaymentOrderId, PaymentOrder>,
    jobs: BTreeMap<JobId, GenerationJob>,
    referrals: Vec<ReferralEvent>,
    settings: HashMap<String, String>,
}

impl Inner {
    /// Apply one balance change and append its entry. `None` means a
    /// deduction the balance does not cover.
    fn apply(
        &mut self,
        id: &AccountId,
        kind: EntryKind,
        amount: i64,
        reason: &str,
    ) -> Result<Option<LedgerEntry>> {
        ensure_positive(amount)?;
        let account = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("account", id))?;

        if kind == EntryKind::Deduct && account.balance < amount {
            return Ok(None);
        }

        let entry = LedgerEntry::new(*id, kind, amount, account.balance, reason.to_string())
            .ok_or(StoreError::InvalidAmount(amount))?;
        account.balance = entry.balance_after;
        account.updated_at = Utc::now();
        self.ledger.push(entry.clone());
        Ok(Some(entry))
    }

    fn apply_infallible(
        &mut self,
        id: &AccountId,
        kind: EntryKind,
        amount: i64,
        reason: &str,
    ) -> Result<LedgerEntry> {
        self.apply(id, kind, amount, reason)?
            .ok_or_else(|| StoreError::Database(format!("{kind} on {id} was refused")))
    }

    /// Check a grant of `amount` would fit without applying it.
    fn check_grant(&self, id: &AccountId, amount: i64) -> Result<()> {
        let account = self
            .accounts
            .get(id)
            .ok_or_else(|| StoreError::not_found("account", id))?;
        account
            .balance
            .checked_add(amount)
            .map(|_| ())
            .ok_or(StoreError::InvalidAmount(amount))
    }

    /// Grant a bonus; a zero bonus writes nothing.
    fn grant_bonus(
        &mut self,
        id: &AccountId,
        amount: i64,
        reason: &str,
    ) -> Result<Option<LedgerEntry>> {
        if amount == 0 {
            return Ok(None);
        }
        self.apply_infallible(id, EntryKind::Grant, amount, reason).map(Some)
    }

    fn order_mut(&mut self, id: &PaymentOrderId) -> Result<&mut PaymentOrder> {
        self.orders
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("order", id))
    }

    fn job_mut(&mut self, id: &JobId) -> Result<&mut GenerationJob> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("job", id))
    }
}

/// In-memory implementation of [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn page<T>(items: impl Iterator<Item = T>, limit: usize, offset: usize) -> Vec<T> {
    items.skip(offset).take(limit).collect()
}

#[async_trait]
impl Store for MemoryStore {
    // =========================================================================
    // Account Operations
    // =========================================================================

    async fn create_account(&self, account: &Account) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.accounts.contains_key(&account.id) {
            return Ok(false);
        }
        inner.accounts.insert(account.id, account.clone());
        Ok(true)
    }

    async fn open_account(
        &self,
        account: &Account,
        signup_bonus: i64,
        reason: &str,
    ) -> Result<Option<Account>> {
        ensure_non_negative(signup_bonus)?;
        let mut inner = self.inner.lock().await;
        if inner.accounts.contains_key(&account.id) {
            return Ok(None);
        }
        account
            .balance
            .checked_add(signup_bonus)
            .ok_or(StoreError::InvalidAmount(signup_bonus))?;
        inner.accounts.insert(account.id, account.clone());
        inner.grant_bonus(&account.id, signup_bonus, reason)?;
        Ok(inner.accounts.get(&account.id).cloned())
    }

    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        Ok(self.inner.lock().await.accounts.get(id).cloned())
    }

    async fn find_account_by_referral_code(&self, code: &str) -> Result<Option<Account>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .accounts
            .values()
            .find(|a| a.referral_code.as_deref() == Some(code))
            .cloned())
    }

    async fn assign_referral_code(&self, id: &AccountId, code: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        let taken = inner
            .accounts
            .values()
            .any(|a| a.id != *id && a.referral_code.as_deref() == Some(code));
        let account = inner
            .accounts
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("account", id))?;

        if let Some(existing) = &account.referral_code {
            return Ok(Some(existing.clone()));
        }
        if taken {
            return Ok(None);
        }
        account.referral_code = Some(code.to_string());
        account.updated_at = Utc::now();
        Ok(Some(code.to_string()))
    }

    // =========================================================================
    // Credit Guard
    // =========================================================================

    async fn deduct(
        &self,
        id: &AccountId,
        amount: i64,
        reason: &str,
    ) -> Result<Option<LedgerEntry>> {
        self.inner
            .lock()
            .await
            .apply(id, EntryKind::Deduct, amount, reason)
    }

    async fn add(&self, id: &AccountId, amount: i64, reason: &str) -> Result<LedgerEntry> {
        self.inner
            .lock()
            .await
            .apply_infallible(id, EntryKind::Grant, amount, reason)
    }

    async fn refund(&self, id: &AccountId, amount: i64, reason: &str) -> Result<LedgerEntry> {
        self.inner
            .lock()
            .await
            .apply_infallible(id, EntryKind::Refund, amount, reason)
    }

    // =========================================================================
    // Ledger
    // =========================================================================

    async fn list_ledger(
        &self,
        id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let inner = self.inner.lock().await;
        let entries = inner.ledger.iter().rev().filter(|e| e.account_id == *id);
        Ok(page(entries.cloned(), limit, offset))
    }

    async fn ledger_for_account(&self, id: &AccountId) -> Result<Vec<LedgerEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .ledger
            .iter()
            .filter(|e| e.account_id == *id)
            .cloned()
            .collect())
    }

    // =========================================================================
    // Payment Orders
    // =========================================================================

    async fn create_payment_order(&self, order: &PaymentOrder) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let duplicate = inner.orders.values().any(|o| {
            o.id == order.id
                || (o.provider == order.provider && o.external_order_id == order.external_order_id)
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "order {} already exists",
                order.external_order_id
            )));
        }
        inner.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_payment_order(&self, id: &PaymentOrderId) -> Result<Option<PaymentOrder>> {
        Ok(self.inner.lock().await.orders.get(id).cloned())
    }

    async fn find_payment_order(
        &self,
        provider: PaymentProvider,
        external_order_id: &str,
    ) -> Result<Option<PaymentOrder>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .orders
            .values()
            .find(|o| o.provider == provider && o.external_order_id == external_order_id)
            .cloned())
    }

    async fn find_payment_order_by_payment_ref(
        &self,
        provider: PaymentProvider,
        payment_ref: &str,
    ) -> Result<Option<PaymentOrder>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .orders
            .values()
            .find(|o| o.provider == provider && o.payment_ref.as_deref() == Some(payment_ref))
            .cloned())
    }

    async fn list_payment_orders(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PaymentOrder>> {
        let inner = self.inner.lock().await;
        let mut orders: Vec<_> = inner
            .orders
            .values()
            .filter(|o| o.account_id == *account_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(page(orders.into_iter(), limit, offset))
    }

    async fn mark_payment_processing(
        &self,
        id: &PaymentOrderId,
        payment_ref: Option<&str>,
    ) -> Result<OrderUpdate> {
        let mut inner = self.inner.lock().await;
        let order = inner.order_mut(id)?;
        let transition = order.processing_check();
        if transition.is_apply() {
            order.status = OrderStatus::Processing;
            if let Some(r) = payment_ref {
                order.payment_ref = Some(r.to_string());
            }
        }
        Ok(OrderUpdate {
            order: order.clone(),
            transition,
            entry: None,
        })
    }

    async fn settle_payment_order(
        &self,
        id: &PaymentOrderId,
        payment_ref: Option<&str>,
    ) -> Result<OrderUpdate> {
        let mut inner = self.inner.lock().await;
        let order = inner.order_mut(id)?.clone();
        let transition = order.settle_check();
        if !transition.is_apply() {
            return Ok(OrderUpdate {
                order,
                transition,
                entry: None,
            });
        }

        let entry = inner.apply_infallible(
            &order.account_id,
            EntryKind::Grant,
            order.credits_granted(),
            &order.grant_reason(),
        )?;
        let stored = inner.order_mut(id)?;
        stored.status = OrderStatus::Success;
        stored.completed_at = Some(Utc::now());
        if let Some(r) = payment_ref {
            stored.payment_ref = Some(r.to_string());
        }
        Ok(OrderUpdate {
            order: stored.clone(),
            transition,
            entry: Some(entry),
        })
    }

    async fn fail_payment_order(&self, id: &PaymentOrderId, error: &str) -> Result<OrderUpdate> {
        let mut inner = self.inner.lock().await;
        let order = inner.order_mut(id)?;
        let transition = order.fail_check();
        if transition.is_apply() {
            order.status = OrderStatus::Failed;
            order.error_message = Some(error.to_string());
            order.completed_at = Some(Utc::now());
        }
        Ok(OrderUpdate {
            order: order.clone(),
            transition,
            entry: None,
        })
    }

    async fn refund_payment_order(&self, id: &PaymentOrderId) -> Result<OrderUpdate> {
        let mut inner = self.inner.lock().await;
        let order = inner.order_mut(id)?.clone();
        let transition = order.refund_check();
        if !transition.is_apply() {
            return Ok(OrderUpdate {
                order,
                transition,
                entry: None,
            });
        }

        let balance = inner
            .accounts
            .get(&order.account_id)
            .map(|a| a.balance)
            .ok_or_else(|| StoreError::not_found("account", order.account_id))?;
        let reversal = order.credits_granted().min(balance);
        let entry = if reversal > 0 {
            inner.apply(
                &order.account_id,
                EntryKind::Deduct,
                reversal,
                &order.reversal_reason(),
            )?
        } else {
            None
        };

        let stored = inner.order_mut(id)?;
        stored.status = OrderStatus::Refunded;
        stored.completed_at = Some(Utc::now());
        Ok(OrderUpdate {
            order: stored.clone(),
            transition,
            entry,
        })
    }

    // =========================================================================
    // Generation Jobs
    // =========================================================================

    async fn create_jobs(
        &self,
        jobs: &[GenerationJob],
        reason: &str,
    ) -> Result<Option<LedgerEntry>> {
        let (account_id, total) = batch_hold(jobs)?;
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.apply(&account_id, EntryKind::Deduct, total, reason)? else {
            return Ok(None);
        };
        for job in jobs {
            inner.jobs.insert(job.id, job.clone());
        }
        Ok(Some(entry))
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<GenerationJob>> {
        Ok(self.inner.lock().await.jobs.get(id).cloned())
    }

    async fn find_job_by_task_id(&self, task_id: &str) -> Result<Option<GenerationJob>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .find(|j| j.external_task_id.as_deref() == Some(task_id))
            .cloned())
    }

    async fn list_jobs(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<GenerationJob>> {
        let inner = self.inner.lock().await;
        let jobs = inner
            .jobs
            .values()
            .rev()
            .filter(|j| j.account_id == *account_id);
        Ok(page(jobs.cloned(), limit, offset))
    }

    async fn list_active_jobs(&self, limit: usize) -> Result<Vec<GenerationJob>> {
        let inner = self.inner.lock().await;
        let jobs = inner.jobs.values().filter(|j| !j.status.is_terminal());
        Ok(page(jobs.cloned(), limit, 0))
    }

    async fn attach_task_id(&self, id: &JobId, task_id: &str) -> Result<GenerationJob> {
        let mut inner = self.inner.lock().await;
        let job = inner.job_mut(id)?;
        if !job.status.is_terminal() {
            job.external_task_id = Some(task_id.to_string());
        }
        Ok(job.clone())
    }

    async fn complete_job(&self, id: &JobId, result_url: &str) -> Result<JobUpdate> {
        let mut inner = self.inner.lock().await;
        let job = inner.job_mut(id)?;
        let transition = job.complete_check();
        if transition.is_apply() {
            job.status = JobStatus::Completed;
            job.result_url = Some(result_url.to_string());
            job.completed_at = Some(Utc::now());
        }
        Ok(JobUpdate {
            job: job.clone(),
            transition,
            entry: None,
        })
    }

    async fn fail_job(&self, id: &JobId, error: &str) -> Result<JobUpdate> {
        let mut inner = self.inner.lock().await;
        let job = inner.job_mut(id)?.clone();
        let transition = job.fail_check();
        if !transition.is_apply() {
            return Ok(JobUpdate {
                job,
                transition,
                entry: None,
            });
        }

        let entry = if job.credit_cost > 0 {
            Some(inner.apply_infallible(
                &job.account_id,
                EntryKind::Refund,
                job.credit_cost,
                &job.refund_reason(error),
            )?)
        } else {
            None
        };
        let stored = inner.job_mut(id)?;
        stored.status = JobStatus::Failed;
        stored.error_message = Some(error.to_string());
        stored.completed_at = Some(Utc::now());
        Ok(JobUpdate {
            job: stored.clone(),
            transition,
            entry,
        })
    }

    async fn cancel_job(&self, id: &JobId, reason: &str) -> Result<JobUpdate> {
        let mut inner = self.inner.lock().await;
        let job = inner.job_mut(id)?;
        let transition = job.cancel_check();
        if transition.is_apply() {
            job.status = JobStatus::Cancelled;
            job.error_message = Some(reason.to_string());
            job.completed_at = Some(Utc::now());
        }
        Ok(JobUpdate {
            job: job.clone(),
            transition,
            entry: None,
        })
    }

    // =========================================================================
    // Referrals
    // =========================================================================

    async fn apply_referral(
        &self,
        referred: &AccountId,
        code: &str,
        bonus: ReferralBonus,
    ) -> Result<ReferralOutcome> {
        ensure_bonus(bonus)?;
        let mut inner = self.inner.lock().await;
        let account = inner
            .accounts
            .get(referred)
            .ok_or_else(|| StoreError::not_found("account", referred))?;
        if account.is_referred() {
            return Ok(ReferralOutcome::AlreadyReferred);
        }

        let Some(referrer) = inner
            .accounts
            .values()
            .find(|a| a.referral_code.as_deref() == Some(code))
            .map(|a| a.id)
        else {
            return Ok(ReferralOutcome::InvalidCode);
        };
        if referrer == *referred {
            return Ok(ReferralOutcome::SelfReferral);
        }

        // Both grants must fit before either is applied.
        inner.check_grant(&referrer, bonus.referrer)?;
        inner.check_grant(referred, bonus.referred)?;

        let event = ReferralEvent::new(referrer, *referred, code.to_string(), bonus);
        let referrer_entry =
            inner.grant_bonus(&referrer, bonus.referrer, &event.referrer_reason())?;
        let referred_entry =
            inner.grant_bonus(referred, bonus.referred, &event.referred_reason())?;
        if let Some(account) = inner.accounts.get_mut(referred) {
            account.referred_by = Some(referrer);
        }
        inner.referrals.push(event.clone());

        Ok(ReferralOutcome::Applied {
            event,
            referrer_entry,
            referred_entry,
        })
    }

    async fn referral_stats(&self, referrer: &AccountId) -> Result<ReferralStats> {
        let inner = self.inner.lock().await;
        Ok(inner
            .referrals
            .iter()
            .filter(|e| e.referrer_id == *referrer)
            .fold(ReferralStats::default(), |mut stats, e| {
                stats.referral_count += 1;
                stats.total_bonus_earned += e.referrer_bonus;
                stats
            }))
    }

    async fn list_referrals(&self, referrer: &AccountId) -> Result<Vec<ReferralEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .referrals
            .iter()
            .rev()
            .filter(|e| e.referrer_id == *referrer)
            .cloned()
            .collect())
    }

    // =========================================================================
    // Settings
    // =========================================================================

    async fn list_settings(&self) -> Result<HashMap<String, String>> {
        Ok(self.inner.lock().await.settings.clone())
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creditline_core::{
        reconstruct_balance, EnhancementMode, JobPayload, PricingConfig, SkinEnhancement,
    };
    use std::sync::Arc;

    async fn funded(store: &MemoryStore, balance: i64) -> AccountId {
        let id = AccountId::generate();
        store.create_account(&Account::new(id, None)).await.unwrap();
        if balance > 0 {
            store.add(&id, balance, "seed").await.unwrap();
        }
        id
    }

    fn job(account: AccountId, cost: i64) -> GenerationJob {
        let payload = JobPayload::SkinEnhancement(SkinEnhancement {
            image_url: "https://cdn.example.com/face.jpg".into(),
            mode: EnhancementMode::StudioLook,
            pro_mode: false,
        });
        GenerationJob::new(account, payload, cost, None)
    }

    async fn assert_ledger_matches(store: &MemoryStore, id: &AccountId) {
        let account = store.get_account(id).await.unwrap().unwrap();
        let entries = store.ledger_for_account(id).await.unwrap();
        assert_eq!(
            reconstruct_balance(account.opening_balance, &entries),
            account.balance
        );
    }

    #[tokio::test]
    async fn create_account_is_insert_if_absent() {
        let store = MemoryStore::new();
        let id = funded(&store, 40).await;
        assert!(!store.create_account(&Account::new(id, None)).await.unwrap());
        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, 40);
    }

    #[tokio::test]
    async fn open_account_grants_signup_bonus_in_one_step() {
        let store = MemoryStore::new();
        let id = AccountId::generate();

        let account = store
            .open_account(&Account::new(id, None), 25, "signup bonus")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.balance, 25);
        assert!(store
            .open_account(&Account::new(id, None), 25, "signup bonus")
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.ledger_for_account(&id).await.unwrap().len(), 1);

        let unbonused = AccountId::generate();
        let account = store
            .open_account(&Account::new(unbonused, None), 0, "signup bonus")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.balance, 0);
        assert!(store.ledger_for_account(&unbonused).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn refused_signup_bonus_leaves_no_account() {
        let store = MemoryStore::new();
        let id = AccountId::generate();
        let mut account = Account::new(id, None);
        account.balance = i64::MAX;
        account.opening_balance = i64::MAX;

        assert!(matches!(
            store.open_account(&account, 1, "signup bonus").await,
            Err(StoreError::InvalidAmount(1))
        ));
        assert!(matches!(
            store.open_account(&Account::new(id, None), -1, "signup bonus").await,
            Err(StoreError::InvalidAmount(-1))
        ));
        assert!(store.get_account(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn grant_past_max_balance_is_refused() {
        let store = MemoryStore::new();
        let id = funded(&store, 0).await;
        store.add(&id, i64::MAX, "max").await.unwrap();

        assert!(matches!(
            store.add(&id, 1, "one more").await,
            Err(StoreError::InvalidAmount(1))
        ));
        assert!(matches!(
            store.refund(&id, 1, "one more").await,
            Err(StoreError::InvalidAmount(1))
        ));
        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, i64::MAX);
        assert_eq!(store.ledger_for_account(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deduct_refuses_overdraft_without_writing() {
        let store = MemoryStore::new();
        let id = funded(&store, 20).await;

        assert!(store.deduct(&id, 30, "too much").await.unwrap().is_none());
        assert_eq!(store.ledger_for_account(&id).await.unwrap().len(), 1);

        let entry = store.deduct(&id, 20, "exact").await.unwrap().unwrap();
        assert_eq!(entry.balance_before, 20);
        assert_eq!(entry.balance_after, 0);
        assert_ledger_matches(&store, &id).await;
    }

    #[tokio::test]
    async fn primitives_reject_bad_input() {
        let store = MemoryStore::new();
        let id = funded(&store, 10).await;
        assert!(matches!(
            store.add(&id, 0, "zero").await,
            Err(StoreError::InvalidAmount(0))
        ));
        assert!(matches!(
            store.refund(&AccountId::generate(), 5, "ghost").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_deducts_never_overdraw() {
        let store = Arc::new(MemoryStore::new());
        let id = funded(&store, 100).await;

        let tasks = (0..10).map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.deduct(&id, 30, "race").await.unwrap() })
        });
        let results = futures::future::join_all(tasks).await;
        let successes = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Some(_))))
            .count();

        assert_eq!(successes, 3);
        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, 10);
        assert_ledger_matches(&store, &id).await;
    }

    #[tokio::test]
    async fn failed_job_refunds_once() {
        let store = MemoryStore::new();
        let id = funded(&store, 100).await;
        let job = job(id, 30);

        store
            .create_jobs(std::slice::from_ref(&job), &job.hold_reason())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, 70);

        let first = store.fail_job(&job.id, "provider error").await.unwrap();
        let second = store.fail_job(&job.id, "late callback").await.unwrap();
        assert_eq!(first.transition, Transition::Apply);
        assert!(first.entry.is_some());
        assert_eq!(second.transition, Transition::AlreadyApplied);
        assert!(second.entry.is_none());

        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, 100);
        let kinds: Vec<_> = store
            .ledger_for_account(&id)
            .await
            .unwrap()
            .into_iter()
            .skip(1)
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EntryKind::Deduct, EntryKind::Refund]);
    }

    #[tokio::test]
    async fn insufficient_hold_creates_no_job() {
        let store = MemoryStore::new();
        let id = funded(&store, 10).await;
        let job = job(id, 30);

        let hold = store.create_jobs(std::slice::from_ref(&job), "hold").await.unwrap();
        assert!(hold.is_none());
        assert!(store.get_job(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completed_job_cannot_fail() {
        let store = MemoryStore::new();
        let id = funded(&store, 50).await;
        let job = job(id, 30);
        store.create_jobs(std::slice::from_ref(&job), "hold").await.unwrap();

        store.complete_job(&job.id, "https://cdn.example.com/out.jpg").await.unwrap();
        let late = store.fail_job(&job.id, "timeout").await.unwrap();
        assert_eq!(late.transition, Transition::Rejected);
        assert_eq!(late.job.status, JobStatus::Completed);
        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, 20);
    }

    #[tokio::test]
    async fn order_settles_once_and_refund_clamps() {
        let store = MemoryStore::new();
        let id = funded(&store, 0).await;
        let pricing = PricingConfig::default();
        let order = PaymentOrder::new(
            PaymentOrderId::generate(),
            id,
            PaymentProvider::Stripe,
            "cs_test_42".into(),
            pricing.package("popular").unwrap(),
        );
        store.create_payment_order(&order).await.unwrap();

        let first = store.settle_payment_order(&order.id, Some("pi_1")).await.unwrap();
        let replay = store.settle_payment_order(&order.id, Some("pi_1")).await.unwrap();
        assert_eq!(first.entry.unwrap().amount, 330);
        assert_eq!(replay.transition, Transition::AlreadyApplied);
        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, 330);

        store.deduct(&id, 300, "spent").await.unwrap().unwrap();
        let refunded = store.refund_payment_order(&order.id).await.unwrap();
        assert_eq!(refunded.entry.unwrap().amount, 30);
        assert_eq!(refunded.order.status, OrderStatus::Refunded);
        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, 0);

        let stale = store.fail_payment_order(&order.id, "late failure").await.unwrap();
        assert_eq!(stale.transition, Transition::Rejected);
        assert_ledger_matches(&store, &id).await;
    }

    #[tokio::test]
    async fn concurrent_settlements_grant_once() {
        let store = Arc::new(MemoryStore::new());
        let id = funded(&store, 0).await;
        let pricing = PricingConfig::default();
        let order = PaymentOrder::new(
            PaymentOrderId::generate(),
            id,
            PaymentProvider::Stripe,
            "cs_test_race".into(),
            pricing.package("popular").unwrap(),
        );
        store.create_payment_order(&order).await.unwrap();

        let tasks = (0..2).map(|_| {
            let store = Arc::clone(&store);
            let order_id = order.id;
            tokio::spawn(async move {
                store
                    .settle_payment_order(&order_id, Some("pi_race"))
                    .await
                    .unwrap()
            })
        });
        let updates: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(std::result::Result::unwrap)
            .collect();

        let applied = updates.iter().filter(|u| u.transition.is_apply()).count();
        assert_eq!(applied, 1);
        assert_eq!(updates.iter().filter(|u| u.entry.is_some()).count(), 1);
        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, 330);
        assert_eq!(store.ledger_for_account(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_external_order_id_conflicts() {
        let store = MemoryStore::new();
        let id = funded(&store, 0).await;
        let pricing = PricingConfig::default();
        let package = pricing.package("starter").unwrap();
        let a = PaymentOrder::new(PaymentOrderId::generate(), id, PaymentProvider::Shopier, "ORD-1".into(), package);
        let b = PaymentOrder::new(PaymentOrderId::generate(), id, PaymentProvider::Shopier, "ORD-1".into(), package);
        store.create_payment_order(&a).await.unwrap();
        assert!(matches!(
            store.create_payment_order(&b).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn referral_applies_once() {
        let store = MemoryStore::new();
        let referrer = funded(&store, 0).await;
        let referred = funded(&store, 0).await;
        store.assign_referral_code(&referrer, "ABCD1234").await.unwrap();

        let outcome = store
            .apply_referral(&referred, "ABCD1234", ReferralBonus::default())
            .await
            .unwrap();
        assert!(matches!(outcome, ReferralOutcome::Applied { .. }));
        let again = store
            .apply_referral(&referred, "ABCD1234", ReferralBonus::default())
            .await
            .unwrap();
        assert_eq!(again, ReferralOutcome::AlreadyReferred);

        assert_eq!(store.get_account(&referrer).await.unwrap().unwrap().balance, 50);
        assert_eq!(store.get_account(&referred).await.unwrap().unwrap().balance, 20);
        let stats = store.referral_stats(&referrer).await.unwrap();
        assert_eq!(stats.referral_count, 1);
        assert_eq!(stats.total_bonus_earned, 50);
    }

    #[tokio::test]
    async fn zero_bonus_still_records_referral() {
        let store = MemoryStore::new();
        let referrer = funded(&store, 100).await;
        let referred = funded(&store, 0).await;
        store.assign_referral_code(&referrer, "ZERO0001").await.unwrap();
        let bonus = ReferralBonus {
            referrer: 50,
            referred: 0,
        };

        let outcome = store.apply_referral(&referred, "ZERO0001", bonus).await.unwrap();
        let ReferralOutcome::Applied {
            referrer_entry,
            referred_entry,
            ..
        } = outcome
        else {
            panic!("referral was not applied");
        };
        assert_eq!(referrer_entry.unwrap().amount, 50);
        assert!(referred_entry.is_none());

        let again = store.apply_referral(&referred, "ZERO0001", bonus).await.unwrap();
        assert_eq!(again, ReferralOutcome::AlreadyReferred);

        assert_eq!(store.get_account(&referrer).await.unwrap().unwrap().balance, 150);
        let referred_account = store.get_account(&referred).await.unwrap().unwrap();
        assert_eq!(referred_account.referred_by, Some(referrer));
        assert!(store.ledger_for_account(&referred).await.unwrap().is_empty());
        assert_eq!(store.list_referrals(&referrer).await.unwrap().len(), 1);
        assert_ledger_matches(&store, &referrer).await;
    }

    #[tokio::test]
    async fn refused_bonus_writes_nothing() {
        let store = MemoryStore::new();
        let referrer = funded(&store, 100).await;
        let referred = funded(&store, 0).await;
        store.assign_referral_code(&referrer, "FULL0001").await.unwrap();
        store.add(&referred, i64::MAX, "whale").await.unwrap();

        let negative = ReferralBonus {
            referrer: 50,
            referred: -5,
        };
        assert!(matches!(
            store.apply_referral(&referred, "FULL0001", negative).await,
            Err(StoreError::InvalidAmount(-5))
        ));
        assert!(matches!(
            store
                .apply_referral(&referred, "FULL0001", ReferralBonus::default())
                .await,
            Err(StoreError::InvalidAmount(_))
        ));

        assert_eq!(store.get_account(&referrer).await.unwrap().unwrap().balance, 100);
        assert!(store.list_referrals(&referrer).await.unwrap().is_empty());
        assert!(!store.get_account(&referred).await.unwrap().unwrap().is_referred());
    }

    #[tokio::test]
    async fn concurrent_redemptions_apply_once() {
        let store = Arc::new(MemoryStore::new());
        let referrer = funded(&store, 0).await;
        let referred = funded(&store, 0).await;
        store.assign_referral_code(&referrer, "RACE0001").await.unwrap();

        let tasks = (0..2).map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .apply_referral(&referred, "RACE0001", ReferralBonus::default())
                    .await
                    .unwrap()
            })
        });
        let outcomes: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(std::result::Result::unwrap)
            .collect();

        let applied = outcomes
            .iter()
            .filter(|o| matches!(o, ReferralOutcome::Applied { .. }))
            .count();
        assert_eq!(applied, 1);
        assert!(outcomes.contains(&ReferralOutcome::AlreadyReferred));
        assert_eq!(store.get_account(&referrer).await.unwrap().unwrap().balance, 50);
        assert_eq!(store.get_account(&referred).await.unwrap().unwrap().balance, 20);
        assert_eq!(store.list_referrals(&referrer).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn self_referral_and_unknown_code_are_refused() {
        let store = MemoryStore::new();
        let id = funded(&store, 0).await;
        store.assign_referral_code(&id, "SELF0001").await.unwrap();

        let own = store
            .apply_referral(&id, "SELF0001", ReferralBonus::default())
            .await
            .unwrap();
        let unknown = store
            .apply_referral(&id, "NOPE0000", ReferralBonus::default())
            .await
            .unwrap();
        assert_eq!(own, ReferralOutcome::SelfReferral);
        assert_eq!(unknown, ReferralOutcome::InvalidCode);
        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, 0);
    }

    #[tokio::test]
    async fn referral_code_is_set_once_and_unique() {
        let store = MemoryStore::new();
        let a = funded(&store, 0).await;
        let b = funded(&store, 0).await;

        assert_eq!(
            store.assign_referral_code(&a, "AAAA1111").await.unwrap().as_deref(),
            Some("AAAA1111")
        );
        assert_eq!(
            store.assign_referral_code(&a, "BBBB2222").await.unwrap().as_deref(),
            Some("AAAA1111")
        );
        assert_eq!(store.assign_referral_code(&b, "AAAA1111").await.unwrap(), None);
    }
}
