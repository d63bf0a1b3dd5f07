//! `RocksDB` storage implementation.
//!
//! Values are CBOR. Every compound operation is staged into one
//! [`WriteBatch`] while holding the store's write lock, so the balance, its
//! ledger entry, index updates and status changes land together. Reads do not
//! take the lock.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use tokio::sync::Mutex;

use creditline_core::{
    Account, AccountId, EntryKind, GenerationJob, JobId, JobStatus, LedgerEntry, OrderStatus,
    PaymentOrder, PaymentOrderId, PaymentProvider, ReferralBonus, ReferralEvent, ReferralOutcome,
    ReferralStats,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf, LEDGER_SEQ_KEY};
use crate::{
    batch_hold, ensure_bonus, ensure_non_negative, ensure_positive, JobUpdate, OrderUpdate, Store,
};

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    write_lock: Mutex<()>,
}

fn db_err(e: rocksdb::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(db_err)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get_raw(&self, name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(name)?;
        self.db.get_cf(&cf, key).map_err(db_err)
    }

    fn get<T: serde::de::DeserializeOwned>(&self, name: &str, key: &[u8]) -> Result<Option<T>> {
        self.get_raw(name, key)?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// Values of an id index (`key -> 16-byte id`) resolved in `target`.
    fn resolve<T: serde::de::DeserializeOwned>(
        &self,
        index: &str,
        key: &[u8],
        target: &str,
    ) -> Result<Option<T>> {
        match self.get_raw(index, key)? {
            Some(id) => self.get(target, &id),
            None => Ok(None),
        }
    }

    /// Keys of `name` starting with `prefix`, in key order.
    fn scan_keys(&self, name: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf(name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        let mut items = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(db_err)?;
            if !key.starts_with(prefix) {
                break;
            }
            items.push((key, value));
        }
        Ok(items)
    }

    /// Records of an owner-scoped index, newest first, paged.
    fn list_owned<T: serde::de::DeserializeOwned>(
        &self,
        index: &str,
        target: &str,
        owner: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<T>> {
        let keys = self.scan_keys(index, &keys::owner_prefix(owner))?;
        let mut out = Vec::new();
        for (key, _) in keys.iter().rev().skip(offset).take(limit) {
            if let Some(id) = keys::child_id(key) {
                if let Some(record) = self.get(target, &id)? {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    fn unit(&self) -> Unit<'_> {
        Unit {
            store: self,
            batch: WriteBatch::default(),
            accounts: HashMap::new(),
            next_seq: None,
        }
    }
}

/// One atomic write: staged account balances plus a batch of puts.
struct Unit<'a> {
    store: &'a RocksStore,
    batch: WriteBatch,
    accounts: HashMap<AccountId, Account>,
    next_seq: Option<u64>,
}

impl Unit<'_> {
    fn account(&mut self, id: &AccountId) -> Result<&mut Account> {
        if !self.accounts.contains_key(id) {
            let account: Account = self
                .store
                .get(cf::ACCOUNTS, &keys::account_key(id))?
                .ok_or_else(|| StoreError::not_found("account", id))?;
            self.accounts.insert(*id, account);
        }
        self.accounts
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("account", id))
    }

    fn seq(&mut self) -> Result<u64> {
        let current = match self.next_seq {
            Some(seq) => seq,
            None => self
                .store
                .get_raw(cf::META, LEDGER_SEQ_KEY)?
                .and_then(|v| <[u8; 8]>::try_from(v.as_slice()).ok())
                .map_or(0, u64::from_be_bytes),
        };
        self.next_seq = Some(current + 1);
        Ok(current)
    }

    fn put_raw(&mut self, name: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = self.store.cf(name)?;
        self.batch.put_cf(&cf, key, value);
        Ok(())
    }

    fn put<T: serde::Serialize>(&mut self, name: &str, key: &[u8], value: &T) -> Result<()> {
        let bytes = RocksStore::serialize(value)?;
        self.put_raw(name, key, &bytes)
    }

    fn delete(&mut self, name: &str, key: &[u8]) -> Result<()> {
        let cf = self.store.cf(name)?;
        self.batch.delete_cf(&cf, key);
        Ok(())
    }

    /// Stage one balance change and its ledger entry. `None` means a
    /// deduction the balance does not cover.
    fn apply(
        &mut self,
        id: &AccountId,
        kind: EntryKind,
        amount: i64,
        reason: &str,
    ) -> Result<Option<LedgerEntry>> {
        ensure_positive(amount)?;
        let account = self.account(id)?;
        if kind == EntryKind::Deduct && account.balance < amount {
            return Ok(None);
        }
        let entry = LedgerEntry::new(*id, kind, amount, account.balance, reason.to_string())
            .ok_or(StoreError::InvalidAmount(amount))?;
        account.balance = entry.balance_after;
        account.updated_at = Utc::now();

        let seq = self.seq()?;
        self.put(cf::LEDGER, &entry.id.to_bytes(), &entry)?;
        self.put_raw(
            cf::LEDGER_BY_ACCOUNT,
            &keys::ledger_index_key(id, seq),
            &entry.id.to_bytes(),
        )?;
        Ok(Some(entry))
    }

    fn apply_credit(
        &mut self,
        id: &AccountId,
        kind: EntryKind,
        amount: i64,
        reason: &str,
    ) -> Result<LedgerEntry> {
        self.apply(id, kind, amount, reason)?
            .ok_or_else(|| StoreError::Database(format!("{kind} on {id} was refused")))
    }

    fn grant_bonus(
        &mut self,
        id: &AccountId,
        amount: i64,
        reason: &str,
    ) -> Result<Option<LedgerEntry>> {
        if amount == 0 {
            return Ok(None);
        }
        self.apply_credit(id, EntryKind::Grant, amount, reason).map(Some)
    }

    fn put_order(&mut self, order: &PaymentOrder) -> Result<()> {
        if let Some(payment_ref) = &order.payment_ref {
            self.put_raw(
                cf::ORDERS_BY_PAYMENT_REF,
                &keys::provider_key(order.provider, payment_ref),
                &order.id.to_bytes(),
            )?;
        }
        self.put(cf::ORDERS, &order.id.to_bytes(), order)
    }

    fn put_job(&mut self, job: &GenerationJob) -> Result<()> {
        if job.status.is_terminal() {
            self.delete(cf::JOBS_ACTIVE, &job.id.to_bytes())?;
        }
        if let Some(task_id) = &job.external_task_id {
            self.put_raw(cf::JOBS_BY_TASK, task_id.as_bytes(), &job.id.to_bytes())?;
        }
        self.put(cf::JOBS, &job.id.to_bytes(), job)
    }

    fn commit(mut self) -> Result<()> {
        let accounts: Vec<Account> = self.accounts.drain().map(|(_, a)| a).collect();
        for account in &accounts {
            self.put(cf::ACCOUNTS, &keys::account_key(&account.id), account)?;
        }
        if let Some(seq) = self.next_seq {
            self.put_raw(cf::META, LEDGER_SEQ_KEY, &seq.to_be_bytes())?;
        }
        self.store.db.write(self.batch).map_err(db_err)
    }
}

#[async_trait]
impl Store for RocksStore {
    // =========================================================================
    // Account Operations
    // =========================================================================

    async fn create_account(&self, account: &Account) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let key = keys::account_key(&account.id);
        if self.get_raw(cf::ACCOUNTS, &key)?.is_some() {
            return Ok(false);
        }
        let mut unit = self.unit();
        unit.put(cf::ACCOUNTS, &key, account)?;
        if let Some(code) = &account.referral_code {
            unit.put_raw(cf::REFERRAL_CODES, code.as_bytes(), account.id.as_bytes())?;
        }
        unit.commit()?;
        Ok(true)
    }

    async fn open_account(
        &self,
        account: &Account,
        signup_bonus: i64,
        reason: &str,
    ) -> Result<Option<Account>> {
        ensure_non_negative(signup_bonus)?;
        let _guard = self.write_lock.lock().await;
        if self.get_raw(cf::ACCOUNTS, &keys::account_key(&account.id))?.is_some() {
            return Ok(None);
        }
        let mut unit = self.unit();
        unit.accounts.insert(account.id, account.clone());
        if let Some(code) = &account.referral_code {
            unit.put_raw(cf::REFERRAL_CODES, code.as_bytes(), account.id.as_bytes())?;
        }
        unit.grant_bonus(&account.id, signup_bonus, reason)?;
        let stored = unit.account(&account.id)?.clone();
        unit.commit()?;
        Ok(Some(stored))
    }

    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        self.get(cf::ACCOUNTS, &keys::account_key(id))
    }

    async fn find_account_by_referral_code(&self, code: &str) -> Result<Option<Account>> {
        self.resolve(cf::REFERRAL_CODES, code.as_bytes(), cf::ACCOUNTS)
    }

    async fn assign_referral_code(&self, id: &AccountId, code: &str) -> Result<Option<String>> {
        let _guard = self.write_lock.lock().await;
        let mut unit = self.unit();
        let account = unit.account(id)?;
        if let Some(existing) = &account.referral_code {
            return Ok(Some(existing.clone()));
        }
        if self.get_raw(cf::REFERRAL_CODES, code.as_bytes())?.is_some() {
            return Ok(None);
        }
        let account = unit.account(id)?;
        account.referral_code = Some(code.to_string());
        account.updated_at = Utc::now();
        unit.put_raw(cf::REFERRAL_CODES, code.as_bytes(), id.as_bytes())?;
        unit.commit()?;
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
        let _guard = self.write_lock.lock().await;
        let mut unit = self.unit();
        let entry = unit.apply(id, EntryKind::Deduct, amount, reason)?;
        if entry.is_some() {
            unit.commit()?;
        }
        Ok(entry)
    }

    async fn add(&self, id: &AccountId, amount: i64, reason: &str) -> Result<LedgerEntry> {
        let _guard = self.write_lock.lock().await;
        let mut unit = self.unit();
        let entry = unit.apply_credit(id, EntryKind::Grant, amount, reason)?;
        unit.commit()?;
        Ok(entry)
    }

    async fn refund(&self, id: &AccountId, amount: i64, reason: &str) -> Result<LedgerEntry> {
        let _guard = self.write_lock.lock().await;
        let mut unit = self.unit();
        let entry = unit.apply_credit(id, EntryKind::Refund, amount, reason)?;
        unit.commit()?;
        Ok(entry)
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
        let index = self.scan_keys(cf::LEDGER_BY_ACCOUNT, &keys::owner_prefix(id))?;
        let mut entries = Vec::new();
        for (_, entry_id) in index.iter().rev().skip(offset).take(limit) {
            if let Some(entry) = self.get(cf::LEDGER, entry_id)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn ledger_for_account(&self, id: &AccountId) -> Result<Vec<LedgerEntry>> {
        let index = self.scan_keys(cf::LEDGER_BY_ACCOUNT, &keys::owner_prefix(id))?;
        let mut entries = Vec::with_capacity(index.len());
        for (_, entry_id) in &index {
            if let Some(entry) = self.get(cf::LEDGER, entry_id)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    // =========================================================================
    // Payment Orders
    // =========================================================================

    async fn create_payment_order(&self, order: &PaymentOrder) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let external = keys::provider_key(order.provider, &order.external_order_id);
        if self.get_raw(cf::ORDERS_BY_EXTERNAL, &external)?.is_some()
            || self.get_raw(cf::ORDERS, &order.id.to_bytes())?.is_some()
        {
            return Err(StoreError::Conflict(format!(
                "order {} already exists",
                order.external_order_id
            )));
        }
        let mut unit = self.unit();
        unit.put_order(order)?;
        unit.put_raw(cf::ORDERS_BY_EXTERNAL, &external, &order.id.to_bytes())?;
        unit.put_raw(
            cf::ORDERS_BY_ACCOUNT,
            &keys::owned_key(&order.account_id, &order.id.to_bytes()),
            &[],
        )?;
        unit.commit()
    }

    async fn get_payment_order(&self, id: &PaymentOrderId) -> Result<Option<PaymentOrder>> {
        self.get(cf::ORDERS, &id.to_bytes())
    }

    async fn find_payment_order(
        &self,
        provider: PaymentProvider,
        external_order_id: &str,
    ) -> Result<Option<PaymentOrder>> {
        self.resolve(
            cf::ORDERS_BY_EXTERNAL,
            &keys::provider_key(provider, external_order_id),
            cf::ORDERS,
        )
    }

    async fn find_payment_order_by_payment_ref(
        &self,
        provider: PaymentProvider,
        payment_ref: &str,
    ) -> Result<Option<PaymentOrder>> {
        self.resolve(
            cf::ORDERS_BY_PAYMENT_REF,
            &keys::provider_key(provider, payment_ref),
            cf::ORDERS,
        )
    }

    async fn list_payment_orders(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PaymentOrder>> {
        self.list_owned(cf::ORDERS_BY_ACCOUNT, cf::ORDERS, account_id, limit, offset)
    }

    async fn mark_payment_processing(
        &self,
        id: &PaymentOrderId,
        payment_ref: Option<&str>,
    ) -> Result<OrderUpdate> {
        let _guard = self.write_lock.lock().await;
        let mut order: PaymentOrder = self
            .get(cf::ORDERS, &id.to_bytes())?
            .ok_or_else(|| StoreError::not_found("order", id))?;
        let transition = order.processing_check();
        if transition.is_apply() {
            order.status = OrderStatus::Processing;
            if let Some(r) = payment_ref {
                order.payment_ref = Some(r.to_string());
            }
            let mut unit = self.unit();
            unit.put_order(&order)?;
            unit.commit()?;
        }
        Ok(OrderUpdate {
            order,
            transition,
            entry: None,
        })
    }

    async fn settle_payment_order(
        &self,
        id: &PaymentOrderId,
        payment_ref: Option<&str>,
    ) -> Result<OrderUpdate> {
        let _guard = self.write_lock.lock().await;
        let mut order: PaymentOrder = self
            .get(cf::ORDERS, &id.to_bytes())?
            .ok_or_else(|| StoreError::not_found("order", id))?;
        let transition = order.settle_check();
        if !transition.is_apply() {
            return Ok(OrderUpdate {
                order,
                transition,
                entry: None,
            });
        }

        let mut unit = self.unit();
        let entry = unit.apply_credit(
            &order.account_id,
            EntryKind::Grant,
            order.credits_granted(),
            &order.grant_reason(),
        )?;
        order.status = OrderStatus::Success;
        order.completed_at = Some(Utc::now());
        if let Some(r) = payment_ref {
            order.payment_ref = Some(r.to_string());
        }
        unit.put_order(&order)?;
        unit.commit()?;
        Ok(OrderUpdate {
            order,
            transition,
            entry: Some(entry),
        })
    }

    async fn fail_payment_order(&self, id: &PaymentOrderId, error: &str) -> Result<OrderUpdate> {
        let _guard = self.write_lock.lock().await;
        let mut order: PaymentOrder = self
            .get(cf::ORDERS, &id.to_bytes())?
            .ok_or_else(|| StoreError::not_found("order", id))?;
        let transition = order.fail_check();
        if transition.is_apply() {
            order.status = OrderStatus::Failed;
            order.error_message = Some(error.to_string());
            order.completed_at = Some(Utc::now());
            let mut unit = self.unit();
            unit.put_order(&order)?;
            unit.commit()?;
        }
        Ok(OrderUpdate {
            order,
            transition,
            entry: None,
        })
    }

    async fn refund_payment_order(&self, id: &PaymentOrderId) -> Result<OrderUpdate> {
        let _guard = self.write_lock.lock().await;
        let mut order: PaymentOrder = self
            .get(cf::ORDERS, &id.to_bytes())?
            .ok_or_else(|| StoreError::not_found("order", id))?;
        let transition = order.refund_check();
        if !transition.is_apply() {
            return Ok(OrderUpdate {
                order,
                transition,
                entry: None,
            });
        }

        let mut unit = self.unit();
        let balance = unit.account(&order.account_id)?.balance;
        let reversal = order.credits_granted().min(balance);
        let entry = if reversal > 0 {
            unit.apply(
                &order.account_id,
                EntryKind::Deduct,
                reversal,
                &order.reversal_reason(),
            )?
        } else {
            None
        };
        order.status = OrderStatus::Refunded;
        order.completed_at = Some(Utc::now());
        unit.put_order(&order)?;
        unit.commit()?;
        Ok(OrderUpdate {
            order,
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
        let _guard = self.write_lock.lock().await;
        let mut unit = self.unit();
        let Some(entry) = unit.apply(&account_id, EntryKind::Deduct, total, reason)? else {
            return Ok(None);
        };
        for job in jobs {
            unit.put_job(job)?;
            unit.put_raw(
                cf::JOBS_BY_ACCOUNT,
                &keys::owned_key(&job.account_id, &job.id.to_bytes()),
                &[],
            )?;
            if !job.status.is_terminal() {
                unit.put_raw(cf::JOBS_ACTIVE, &job.id.to_bytes(), &[])?;
            }
        }
        unit.commit()?;
        Ok(Some(entry))
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<GenerationJob>> {
        self.get(cf::JOBS, &id.to_bytes())
    }

    async fn find_job_by_task_id(&self, task_id: &str) -> Result<Option<GenerationJob>> {
        self.resolve(cf::JOBS_BY_TASK, task_id.as_bytes(), cf::JOBS)
    }

    async fn list_jobs(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<GenerationJob>> {
        self.list_owned(cf::JOBS_BY_ACCOUNT, cf::JOBS, account_id, limit, offset)
    }

    async fn list_active_jobs(&self, limit: usize) -> Result<Vec<GenerationJob>> {
        let active = self.scan_keys(cf::JOBS_ACTIVE, &[])?;
        let mut jobs = Vec::new();
        for (key, _) in active.iter().take(limit) {
            if let Some(job) = self.get(cf::JOBS, key)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn attach_task_id(&self, id: &JobId, task_id: &str) -> Result<GenerationJob> {
        let _guard = self.write_lock.lock().await;
        let mut job: GenerationJob = self
            .get(cf::JOBS, &id.to_bytes())?
            .ok_or_else(|| StoreError::not_found("job", id))?;
        if !job.status.is_terminal() {
            job.external_task_id = Some(task_id.to_string());
            let mut unit = self.unit();
            unit.put_job(&job)?;
            unit.commit()?;
        }
        Ok(job)
    }

    async fn complete_job(&self, id: &JobId, result_url: &str) -> Result<JobUpdate> {
        let _guard = self.write_lock.lock().await;
        let mut job: GenerationJob = self
            .get(cf::JOBS, &id.to_bytes())?
            .ok_or_else(|| StoreError::not_found("job", id))?;
        let transition = job.complete_check();
        if transition.is_apply() {
            job.status = JobStatus::Completed;
            job.result_url = Some(result_url.to_string());
            job.completed_at = Some(Utc::now());
            let mut unit = self.unit();
            unit.put_job(&job)?;
            unit.commit()?;
        }
        Ok(JobUpdate {
            job,
            transition,
            entry: None,
        })
    }

    async fn fail_job(&self, id: &JobId, error: &str) -> Result<JobUpdate> {
        let _guard = self.write_lock.lock().await;
        let mut job: GenerationJob = self
            .get(cf::JOBS, &id.to_bytes())?
            .ok_or_else(|| StoreError::not_found("job", id))?;
        let transition = job.fail_check();
        if !transition.is_apply() {
            return Ok(JobUpdate {
                job,
                transition,
                entry: None,
            });
        }

        let mut unit = self.unit();
        let entry = if job.credit_cost > 0 {
            Some(unit.apply_credit(
                &job.account_id,
                EntryKind::Refund,
                job.credit_cost,
                &job.refund_reason(error),
            )?)
        } else {
            None
        };
        job.status = JobStatus::Failed;
        job.error_message = Some(error.to_string());
        job.completed_at = Some(Utc::now());
        unit.put_job(&job)?;
        unit.commit()?;
        Ok(JobUpdate {
            job,
            transition,
            entry,
        })
    }

    async fn cancel_job(&self, id: &JobId, reason: &str) -> Result<JobUpdate> {
        let _guard = self.write_lock.lock().await;
        let mut job: GenerationJob = self
            .get(cf::JOBS, &id.to_bytes())?
            .ok_or_else(|| StoreError::not_found("job", id))?;
        let transition = job.cancel_check();
        if transition.is_apply() {
            job.status = JobStatus::Cancelled;
            job.error_message = Some(reason.to_string());
            job.completed_at = Some(Utc::now());
            let mut unit = self.unit();
            unit.put_job(&job)?;
            unit.commit()?;
        }
        Ok(JobUpdate {
            job,
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
        let _guard = self.write_lock.lock().await;
        let mut unit = self.unit();
        if unit.account(referred)?.is_referred() {
            return Ok(ReferralOutcome::AlreadyReferred);
        }
        let Some(referrer) = self
            .get_raw(cf::REFERRAL_CODES, code.as_bytes())?
            .and_then(|v| keys::id_bytes(&v))
            .map(|b| AccountId::from_uuid(uuid::Uuid::from_bytes(b)))
        else {
            return Ok(ReferralOutcome::InvalidCode);
        };
        if referrer == *referred {
            return Ok(ReferralOutcome::SelfReferral);
        }

        let event = ReferralEvent::new(referrer, *referred, code.to_string(), bonus);
        let referrer_entry =
            unit.grant_bonus(&referrer, bonus.referrer, &event.referrer_reason())?;
        let referred_entry =
            unit.grant_bonus(referred, bonus.referred, &event.referred_reason())?;
        unit.account(referred)?.referred_by = Some(referrer);
        unit.put(cf::REFERRALS, &event.id.to_bytes(), &event)?;
        unit.put_raw(
            cf::REFERRALS_BY_REFERRER,
            &keys::owned_key(&referrer, &event.id.to_bytes()),
            &[],
        )?;
        unit.commit()?;

        Ok(ReferralOutcome::Applied {
            event,
            referrer_entry,
            referred_entry,
        })
    }

    async fn referral_stats(&self, referrer: &AccountId) -> Result<ReferralStats> {
        let events = self.list_referrals(referrer).await?;
        Ok(ReferralStats {
            referral_count: u64::try_from(events.len()).unwrap_or(u64::MAX),
            total_bonus_earned: events.iter().map(|e| e.referrer_bonus).sum(),
        })
    }

    async fn list_referrals(&self, referrer: &AccountId) -> Result<Vec<ReferralEvent>> {
        self.list_owned::<ReferralEvent>(
            cf::REFERRALS_BY_REFERRER,
            cf::REFERRALS,
            referrer,
            usize::MAX,
            0,
        )
    }

    // =========================================================================
    // Settings
    // =========================================================================

    async fn list_settings(&self) -> Result<HashMap<String, String>> {
        self.scan_keys(cf::SETTINGS, &[])?
            .into_iter()
            .map(|(k, v)| {
                let key = String::from_utf8(k.into_vec())
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                let value = String::from_utf8(v.into_vec())
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok((key, value))
            })
            .collect()
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let cf = self.cf(cf::SETTINGS)?;
        self.db
            .put_cf(&cf, key.as_bytes(), value.as_bytes())
            .map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creditline_core::{
        reconstruct_balance, EnhancementMode, JobPayload, PricingConfig, SkinEnhancement,
        Transition,
    };
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    async fn funded(store: &RocksStore, balance: i64) -> AccountId {
        let id = AccountId::generate();
        store.create_account(&Account::new(id, None)).await.unwrap();
        store.add(&id, balance, "seed").await.unwrap();
        id
    }

    #[tokio::test]
    async fn ledger_keeps_insertion_order() {
        let (store, _dir) = create_test_store();
        let id = funded(&store, 100).await;
        store.deduct(&id, 30, "hold").await.unwrap().unwrap();
        store.refund(&id, 30, "refund: hold").await.unwrap();

        let kinds: Vec<_> = store
            .ledger_for_account(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![EntryKind::Grant, EntryKind::Deduct, EntryKind::Refund]
        );
        let newest = store.list_ledger(&id, 1, 0).await.unwrap();
        assert_eq!(newest[0].kind, EntryKind::Refund);
    }

    #[tokio::test]
    async fn overdraft_is_refused() {
        let (store, _dir) = create_test_store();
        let id = funded(&store, 20).await;
        assert!(store.deduct(&id, 21, "too much").await.unwrap().is_none());
        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, 20);
    }

    #[tokio::test]
    async fn failed_job_leaves_active_index_and_refunds() {
        let (store, _dir) = create_test_store();
        let id = funded(&store, 100).await;
        let job = GenerationJob::new(
            id,
            JobPayload::SkinEnhancement(SkinEnhancement {
                image_url: "https://cdn.example.com/face.jpg".into(),
                mode: EnhancementMode::StudioLook,
                pro_mode: false,
            }),
            30,
            None,
        );
        store
            .create_jobs(std::slice::from_ref(&job), &job.hold_reason())
            .await
            .unwrap()
            .unwrap();
        store.attach_task_id(&job.id, "task-1").await.unwrap();
        assert_eq!(store.list_active_jobs(10).await.unwrap().len(), 1);
        assert_eq!(
            store.find_job_by_task_id("task-1").await.unwrap().unwrap().id,
            job.id
        );

        store.fail_job(&job.id, "provider error").await.unwrap();
        let replay = store.fail_job(&job.id, "provider error").await.unwrap();
        assert_eq!(replay.transition, Transition::AlreadyApplied);
        assert!(store.list_active_jobs(10).await.unwrap().is_empty());

        let account = store.get_account(&id).await.unwrap().unwrap();
        assert_eq!(account.balance, 100);
        let entries = store.ledger_for_account(&id).await.unwrap();
        assert_eq!(reconstruct_balance(0, &entries), 100);
    }

    #[tokio::test]
    async fn order_lookup_by_external_id_and_settlement() {
        let (store, _dir) = create_test_store();
        let id = funded(&store, 1).await;
        let pricing = PricingConfig::default();
        let order = PaymentOrder::new(
            PaymentOrderId::generate(),
            id,
            PaymentProvider::Shopier,
            "ORD-1".into(),
            pricing.package("popular").unwrap(),
        );
        store.create_payment_order(&order).await.unwrap();
        assert!(store.create_payment_order(&order).await.is_err());

        let found = store
            .find_payment_order(PaymentProvider::Shopier, "ORD-1")
            .await
            .unwrap()
            .unwrap();
        store.settle_payment_order(&found.id, None).await.unwrap();
        let replay = store.settle_payment_order(&found.id, None).await.unwrap();
        assert_eq!(replay.transition, Transition::AlreadyApplied);
        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, 331);
        assert_eq!(store.list_payment_orders(&id, 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn referral_round_trip() {
        let (store, _dir) = create_test_store();
        let referrer = funded(&store, 1).await;
        let referred = funded(&store, 1).await;
        store.assign_referral_code(&referrer, "CODE1234").await.unwrap();

        let outcome = store
            .apply_referral(&referred, "CODE1234", ReferralBonus::default())
            .await
            .unwrap();
        assert!(matches!(outcome, ReferralOutcome::Applied { .. }));
        let again = store
            .apply_referral(&referred, "CODE1234", ReferralBonus::default())
            .await
            .unwrap();
        assert_eq!(again, ReferralOutcome::AlreadyReferred);

        let stats = store.referral_stats(&referrer).await.unwrap();
        assert_eq!(stats.referral_count, 1);
        assert_eq!(stats.total_bonus_earned, 50);
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let (store, _dir) = create_test_store();
        store.put_setting("signup_bonus_credits", "40").await.unwrap();
        let settings = store.list_settings().await.unwrap();
        assert_eq!(settings.get("signup_bonus_credits").map(String::as_str), Some("40"));
    }
}
