//! PostgreSQL storage implementation.
//!
//! Deductions are one conditional statement,
//! `UPDATE accounts SET balance = balance - $2 WHERE id = $1 AND balance >= $2`,
//! which is the whole overdraft guard. Grants and refunds are a single atomic
//! increment. Every compound operation runs inside one transaction, with the
//! order, job or account row it decides on locked `FOR UPDATE`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use creditline_core::{
    Account, AccountId, BatchId, EntryKind, GenerationJob, JobId, JobPayload, JobStatus,
    LedgerEntry, LedgerEntryId, OrderStatus, PaymentOrder, PaymentOrderId, PaymentProvider,
    ReferralBonus, ReferralEvent, ReferralId, ReferralOutcome, ReferralStats, Transition,
};

use crate::error::{Result, StoreError};
use crate::{
    batch_hold, ensure_bonus, ensure_non_negative, ensure_positive, JobUpdate, OrderUpdate, Store,
};

const ACCOUNT_COLUMNS: &str = "id, email, balance, opening_balance, referral_code, referred_by, \
     created_at, updated_at";

const LEDGER_COLUMNS: &str =
    "id, account_id, kind, amount, reason, balance_before, balance_after, created_at";

const ORDER_COLUMNS: &str = "id, account_id, provider, external_order_id, payment_ref, \
     package_id, credits_requested, bonus_percent, price_minor, currency, status, error_message, \
     created_at, completed_at";

const JOB_COLUMNS: &str = "id, account_id, batch_id, payload, credit_cost, status, \
     external_task_id, result_url, error_message, created_at, completed_at";

const REFERRAL_COLUMNS: &str =
    "id, referrer_id, referred_id, code, referrer_bonus, referred_bonus, created_at";

/// SQLSTATE raised when `balance` leaves the `bigint` range.
const NUMERIC_OUT_OF_RANGE: &str = "22003";

/// PostgreSQL-backed implementation of [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and apply pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or a migration fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Apply pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn parse<T: std::str::FromStr<Err = String>>(value: &str) -> Result<T> {
    value.parse().map_err(StoreError::Serialization)
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        id: AccountId::from_uuid(row.try_get("id")?),
        email: row.try_get("email")?,
        balance: row.try_get("balance")?,
        opening_balance: row.try_get("opening_balance")?,
        referral_code: row.try_get("referral_code")?,
        referred_by: row
            .try_get::<Option<Uuid>, _>("referred_by")?
            .map(AccountId::from_uuid),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.try_get::<String, _>("id")?.parse::<LedgerEntryId>()?,
        account_id: AccountId::from_uuid(row.try_get("account_id")?),
        kind: parse(row.try_get("kind")?)?,
        amount: row.try_get("amount")?,
        reason: row.try_get("reason")?,
        balance_before: row.try_get("balance_before")?,
        balance_after: row.try_get("balance_after")?,
        created_at: row.try_get("created_at")?,
    })
}

fn order_from_row(row: &PgRow) -> Result<PaymentOrder> {
    Ok(PaymentOrder {
        id: row.try_get::<String, _>("id")?.parse::<PaymentOrderId>()?,
        account_id: AccountId::from_uuid(row.try_get("account_id")?),
        provider: parse(row.try_get("provider")?)?,
        external_order_id: row.try_get("external_order_id")?,
        payment_ref: row.try_get("payment_ref")?,
        package_id: row.try_get("package_id")?,
        credits_requested: row.try_get("credits_requested")?,
        bonus_percent: row.try_get("bonus_percent")?,
        price_minor: row.try_get("price_minor")?,
        currency: row.try_get("currency")?,
        status: parse(row.try_get("status")?)?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<GenerationJob> {
    let batch_id = row
        .try_get::<Option<String>, _>("batch_id")?
        .map(|b| b.parse::<BatchId>())
        .transpose()?;
    let Json(payload) = row.try_get::<Json<JobPayload>, _>("payload")?;
    Ok(GenerationJob {
        id: row.try_get::<String, _>("id")?.parse::<JobId>()?,
        account_id: AccountId::from_uuid(row.try_get("account_id")?),
        batch_id,
        payload,
        credit_cost: row.try_get("credit_cost")?,
        status: parse(row.try_get("status")?)?,
        external_task_id: row.try_get("external_task_id")?,
        result_url: row.try_get("result_url")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn referral_from_row(row: &PgRow) -> Result<ReferralEvent> {
    Ok(ReferralEvent {
        id: row.try_get::<String, _>("id")?.parse::<ReferralId>()?,
        referrer_id: AccountId::from_uuid(row.try_get("referrer_id")?),
        referred_id: AccountId::from_uuid(row.try_get("referred_id")?),
        code: row.try_get("code")?,
        referrer_bonus: row.try_get("referrer_bonus")?,
        referred_bonus: row.try_get("referred_bonus")?,
        created_at: row.try_get("created_at")?,
    })
}

// =============================================================================
// Transaction helpers
// =============================================================================

/// Apply one balance change and append its entry on `conn`.
///
/// Deductions use the conditional update; `None` means the balance did not
/// cover `amount` (or the account is missing, which the caller tells apart).
async fn apply_change(
    conn: &mut PgConnection,
    account_id: &AccountId,
    kind: EntryKind,
    amount: i64,
    reason: &str,
) -> Result<Option<LedgerEntry>> {
    ensure_positive(amount)?;
    let sql = match kind {
        EntryKind::Deduct => {
            "UPDATE accounts SET balance = balance - $2, updated_at = now() \
             WHERE id = $1 AND balance >= $2 RETURNING balance"
        }
        EntryKind::Grant | EntryKind::Refund => {
            "UPDATE accounts SET balance = balance + $2, updated_at = now() \
             WHERE id = $1 RETURNING balance"
        }
    };
    let row = sqlx::query(sql)
        .bind(account_id.as_uuid())
        .bind(amount)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            let out_of_range = matches!(
                &e,
                sqlx::Error::Database(db) if db.code().as_deref() == Some(NUMERIC_OUT_OF_RANGE)
            );
            if out_of_range {
                StoreError::InvalidAmount(amount)
            } else {
                StoreError::from(e)
            }
        })?;
    let Some(row) = row else {
        return Ok(None);
    };

    let balance_after: i64 = row.try_get("balance")?;
    let balance_before = balance_after - kind.signed(amount);
    let entry = LedgerEntry::new(*account_id, kind, amount, balance_before, reason.to_string())
        .ok_or(StoreError::InvalidAmount(amount))?;
    insert_entry(conn, &entry).await?;
    Ok(Some(entry))
}

/// Like [`apply_change`] for changes that cannot be refused by balance.
async fn apply_credit(
    conn: &mut PgConnection,
    account_id: &AccountId,
    kind: EntryKind,
    amount: i64,
    reason: &str,
) -> Result<LedgerEntry> {
    apply_change(conn, account_id, kind, amount, reason)
        .await?
        .ok_or_else(|| StoreError::not_found("account", account_id))
}

/// Grant a bonus; a zero bonus writes nothing.
async fn grant_bonus(
    conn: &mut PgConnection,
    account_id: &AccountId,
    amount: i64,
    reason: &str,
) -> Result<Option<LedgerEntry>> {
    if amount == 0 {
        return Ok(None);
    }
    apply_credit(conn, account_id, EntryKind::Grant, amount, reason)
        .await
        .map(Some)
}

async fn insert_entry(conn: &mut PgConnection, entry: &LedgerEntry) -> Result<()> {
    sqlx::query(
        "INSERT INTO ledger_entries \
         (id, account_id, kind, amount, reason, balance_before, balance_after, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(entry.id.to_string())
    .bind(entry.account_id.as_uuid())
    .bind(entry.kind.as_str())
    .bind(entry.amount)
    .bind(&entry.reason)
    .bind(entry.balance_before)
    .bind(entry.balance_after)
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn account_exists(conn: &mut PgConnection, id: &AccountId) -> Result<bool> {
    let row = sqlx::query("SELECT 1 AS one FROM accounts WHERE id = $1")
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

async fn lock_order(conn: &mut PgConnection, id: &PaymentOrderId) -> Result<PaymentOrder> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM payment_orders WHERE id = $1 FOR UPDATE");
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::not_found("order", id))?;
    order_from_row(&row)
}

async fn write_order_status(conn: &mut PgConnection, order: &PaymentOrder) -> Result<()> {
    sqlx::query(
        "UPDATE payment_orders SET status = $2, payment_ref = $3, error_message = $4, \
         completed_at = $5 WHERE id = $1",
    )
    .bind(order.id.to_string())
    .bind(order.status.as_str())
    .bind(&order.payment_ref)
    .bind(&order.error_message)
    .bind(order.completed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn lock_job(conn: &mut PgConnection, id: &JobId) -> Result<GenerationJob> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1 FOR UPDATE");
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StoreError::not_found("job", id))?;
    job_from_row(&row)
}

async fn write_job_status(conn: &mut PgConnection, job: &GenerationJob) -> Result<()> {
    sqlx::query(
        "UPDATE generation_jobs SET status = $2, external_task_id = $3, result_url = $4, \
         error_message = $5, completed_at = $6 WHERE id = $1",
    )
    .bind(job.id.to_string())
    .bind(job.status.as_str())
    .bind(&job.external_task_id)
    .bind(&job.result_url)
    .bind(&job.error_message)
    .bind(job.completed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    // =========================================================================
    // Account Operations
    // =========================================================================

    async fn create_account(&self, account: &Account) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO accounts \
             (id, email, balance, opening_balance, referral_code, referred_by, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (id) DO NOTHING",
        )
        .bind(account.id.as_uuid())
        .bind(&account.email)
        .bind(account.balance)
        .bind(account.opening_balance)
        .bind(&account.referral_code)
        .bind(account.referred_by.map(|r| *r.as_uuid()))
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn open_account(
        &self,
        account: &Account,
        signup_bonus: i64,
        reason: &str,
    ) -> Result<Option<Account>> {
        ensure_non_negative(signup_bonus)?;
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO accounts \
             (id, email, balance, opening_balance, referral_code, referred_by, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (id) DO NOTHING",
        )
        .bind(account.id.as_uuid())
        .bind(&account.email)
        .bind(account.balance)
        .bind(account.opening_balance)
        .bind(&account.referral_code)
        .bind(account.referred_by.map(|r| *r.as_uuid()))
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        grant_bonus(&mut tx, &account.id, signup_bonus, reason).await?;
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(account.id.as_uuid())
            .fetch_one(&mut *tx)
            .await?;
        let stored = account_from_row(&row)?;
        tx.commit().await?;
        Ok(Some(stored))
    }

    async fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| account_from_row(&row))
            .transpose()
    }

    async fn find_account_by_referral_code(&self, code: &str) -> Result<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE referral_code = $1");
        sqlx::query(&sql)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| account_from_row(&row))
            .transpose()
    }

    async fn assign_referral_code(&self, id: &AccountId, code: &str) -> Result<Option<String>> {
        let updated = sqlx::query(
            "UPDATE accounts SET referral_code = $2, updated_at = now() \
             WHERE id = $1 AND referral_code IS NULL RETURNING referral_code",
        )
        .bind(id.as_uuid())
        .bind(code)
        .fetch_optional(&self.pool)
        .await;

        match updated {
            Ok(Some(row)) => Ok(Some(row.try_get("referral_code")?)),
            Ok(None) => {
                let account = self
                    .get_account(id)
                    .await?
                    .ok_or_else(|| StoreError::not_found("account", id))?;
                Ok(account.referral_code)
            }
            Err(e) => match StoreError::from(e) {
                StoreError::Conflict(_) => Ok(None),
                other => Err(other),
            },
        }
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
        ensure_positive(amount)?;
        let mut tx = self.pool.begin().await?;
        let entry = apply_change(&mut tx, id, EntryKind::Deduct, amount, reason).await?;
        if entry.is_none() && !account_exists(&mut tx, id).await? {
            return Err(StoreError::not_found("account", id));
        }
        tx.commit().await?;
        Ok(entry)
    }

    async fn add(&self, id: &AccountId, amount: i64, reason: &str) -> Result<LedgerEntry> {
        let mut tx = self.pool.begin().await?;
        let entry = apply_credit(&mut tx, id, EntryKind::Grant, amount, reason).await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn refund(&self, id: &AccountId, amount: i64, reason: &str) -> Result<LedgerEntry> {
        let mut tx = self.pool.begin().await?;
        let entry = apply_credit(&mut tx, id, EntryKind::Refund, amount, reason).await?;
        tx.commit().await?;
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
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries WHERE account_id = $1 \
             ORDER BY seq DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(to_i64(limit))
            .bind(to_i64(offset))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn ledger_for_account(&self, id: &AccountId) -> Result<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries WHERE account_id = $1 ORDER BY seq ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    // =========================================================================
    // Payment Orders
    // =========================================================================

    async fn create_payment_order(&self, order: &PaymentOrder) -> Result<()> {
        sqlx::query(
            "INSERT INTO payment_orders \
             (id, account_id, provider, external_order_id, payment_ref, package_id, \
              credits_requested, bonus_percent, price_minor, currency, status, error_message, \
              created_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(order.id.to_string())
        .bind(order.account_id.as_uuid())
        .bind(order.provider.as_str())
        .bind(&order.external_order_id)
        .bind(&order.payment_ref)
        .bind(&order.package_id)
        .bind(order.credits_requested)
        .bind(order.bonus_percent)
        .bind(order.price_minor)
        .bind(&order.currency)
        .bind(order.status.as_str())
        .bind(&order.error_message)
        .bind(order.created_at)
        .bind(order.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_payment_order(&self, id: &PaymentOrderId) -> Result<Option<PaymentOrder>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM payment_orders WHERE id = $1");
        sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| order_from_row(&row))
            .transpose()
    }

    async fn find_payment_order(
        &self,
        provider: PaymentProvider,
        external_order_id: &str,
    ) -> Result<Option<PaymentOrder>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM payment_orders WHERE provider = $1 AND external_order_id = $2"
        );
        sqlx::query(&sql)
            .bind(provider.as_str())
            .bind(external_order_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| order_from_row(&row))
            .transpose()
    }

    async fn find_payment_order_by_payment_ref(
        &self,
        provider: PaymentProvider,
        payment_ref: &str,
    ) -> Result<Option<PaymentOrder>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM payment_orders WHERE provider = $1 AND payment_ref = $2 \
             ORDER BY id DESC LIMIT 1"
        );
        sqlx::query(&sql)
            .bind(provider.as_str())
            .bind(payment_ref)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| order_from_row(&row))
            .transpose()
    }

    async fn list_payment_orders(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PaymentOrder>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM payment_orders WHERE account_id = $1 \
             ORDER BY id DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(account_id.as_uuid())
            .bind(to_i64(limit))
            .bind(to_i64(offset))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn mark_payment_processing(
        &self,
        id: &PaymentOrderId,
        payment_ref: Option<&str>,
    ) -> Result<OrderUpdate> {
        let mut tx = self.pool.begin().await?;
        let mut order = lock_order(&mut tx, id).await?;
        let transition = order.processing_check();
        if transition.is_apply() {
            order.status = OrderStatus::Processing;
            if let Some(r) = payment_ref {
                order.payment_ref = Some(r.to_string());
            }
            write_order_status(&mut tx, &order).await?;
        }
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        let mut order = lock_order(&mut tx, id).await?;
        let transition = order.settle_check();
        if !transition.is_apply() {
            tx.rollback().await?;
            return Ok(OrderUpdate {
                order,
                transition,
                entry: None,
            });
        }

        let entry = apply_credit(
            &mut tx,
            &order.account_id,
            EntryKind::Grant,
            order.credits_granted(),
            &order.grant_reason(),
        )
        .await?;
        order.status = OrderStatus::Success;
        order.completed_at = Some(Utc::now());
        if let Some(r) = payment_ref {
            order.payment_ref = Some(r.to_string());
        }
        write_order_status(&mut tx, &order).await?;
        tx.commit().await?;

        Ok(OrderUpdate {
            order,
            transition,
            entry: Some(entry),
        })
    }

    async fn fail_payment_order(&self, id: &PaymentOrderId, error: &str) -> Result<OrderUpdate> {
        let mut tx = self.pool.begin().await?;
        let mut order = lock_order(&mut tx, id).await?;
        let transition = order.fail_check();
        if transition.is_apply() {
            order.status = OrderStatus::Failed;
            order.error_message = Some(error.to_string());
            order.completed_at = Some(Utc::now());
            write_order_status(&mut tx, &order).await?;
        }
        tx.commit().await?;
        Ok(OrderUpdate {
            order,
            transition,
            entry: None,
        })
    }

    async fn refund_payment_order(&self, id: &PaymentOrderId) -> Result<OrderUpdate> {
        let mut tx = self.pool.begin().await?;
        let mut order = lock_order(&mut tx, id).await?;
        let transition = order.refund_check();
        if !transition.is_apply() {
            tx.rollback().await?;
            return Ok(OrderUpdate {
                order,
                transition,
                entry: None,
            });
        }

        let row = sqlx::query("SELECT balance FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(order.account_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("account", order.account_id))?;
        let balance: i64 = row.try_get("balance")?;
        let reversal = order.credits_granted().min(balance);
        let entry = if reversal > 0 {
            apply_change(
                &mut tx,
                &order.account_id,
                EntryKind::Deduct,
                reversal,
                &order.reversal_reason(),
            )
            .await?
        } else {
            None
        };

        order.status = OrderStatus::Refunded;
        order.completed_at = Some(Utc::now());
        write_order_status(&mut tx, &order).await?;
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        let Some(entry) = apply_change(&mut tx, &account_id, EntryKind::Deduct, total, reason).await?
        else {
            let exists = account_exists(&mut tx, &account_id).await?;
            tx.rollback().await?;
            return if exists {
                Ok(None)
            } else {
                Err(StoreError::not_found("account", account_id))
            };
        };

        for job in jobs {
            sqlx::query(
                "INSERT INTO generation_jobs \
                 (id, account_id, batch_id, payload, credit_cost, status, external_task_id, \
                  result_url, error_message, created_at, completed_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(job.id.to_string())
            .bind(job.account_id.as_uuid())
            .bind(job.batch_id.map(|b| b.to_string()))
            .bind(Json(&job.payload))
            .bind(job.credit_cost)
            .bind(job.status.as_str())
            .bind(&job.external_task_id)
            .bind(&job.result_url)
            .bind(&job.error_message)
            .bind(job.created_at)
            .bind(job.completed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(Some(entry))
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<GenerationJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1");
        sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| job_from_row(&row))
            .transpose()
    }

    async fn find_job_by_task_id(&self, task_id: &str) -> Result<Option<GenerationJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE external_task_id = $1");
        sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| job_from_row(&row))
            .transpose()
    }

    async fn list_jobs(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<GenerationJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE account_id = $1 \
             ORDER BY id DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(account_id.as_uuid())
            .bind(to_i64(limit))
            .bind(to_i64(offset))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn list_active_jobs(&self, limit: usize) -> Result<Vec<GenerationJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE status IN ($1, $2) \
             ORDER BY id ASC LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(JobStatus::Pending.as_str())
            .bind(JobStatus::Processing.as_str())
            .bind(to_i64(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn attach_task_id(&self, id: &JobId, task_id: &str) -> Result<GenerationJob> {
        let mut tx = self.pool.begin().await?;
        let mut job = lock_job(&mut tx, id).await?;
        if !job.status.is_terminal() {
            job.external_task_id = Some(task_id.to_string());
            write_job_status(&mut tx, &job).await?;
        }
        tx.commit().await?;
        Ok(job)
    }

    async fn complete_job(&self, id: &JobId, result_url: &str) -> Result<JobUpdate> {
        let mut tx = self.pool.begin().await?;
        let mut job = lock_job(&mut tx, id).await?;
        let transition = job.complete_check();
        if transition.is_apply() {
            job.status = JobStatus::Completed;
            job.result_url = Some(result_url.to_string());
            job.completed_at = Some(Utc::now());
            write_job_status(&mut tx, &job).await?;
        }
        tx.commit().await?;
        Ok(JobUpdate {
            job,
            transition,
            entry: None,
        })
    }

    async fn fail_job(&self, id: &JobId, error: &str) -> Result<JobUpdate> {
        let mut tx = self.pool.begin().await?;
        let mut job = lock_job(&mut tx, id).await?;
        let transition = job.fail_check();
        if !transition.is_apply() {
            tx.rollback().await?;
            return Ok(JobUpdate {
                job,
                transition,
                entry: None,
            });
        }

        let entry = if job.credit_cost > 0 {
            Some(
                apply_credit(
                    &mut tx,
                    &job.account_id,
                    EntryKind::Refund,
                    job.credit_cost,
                    &job.refund_reason(error),
                )
                .await?,
            )
        } else {
            None
        };
        job.status = JobStatus::Failed;
        job.error_message = Some(error.to_string());
        job.completed_at = Some(Utc::now());
        write_job_status(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(JobUpdate {
            job,
            transition,
            entry,
        })
    }

    async fn cancel_job(&self, id: &JobId, reason: &str) -> Result<JobUpdate> {
        let mut tx = self.pool.begin().await?;
        let mut job = lock_job(&mut tx, id).await?;
        let transition = job.cancel_check();
        if transition.is_apply() {
            job.status = JobStatus::Cancelled;
            job.error_message = Some(reason.to_string());
            job.completed_at = Some(Utc::now());
            write_job_status(&mut tx, &job).await?;
        }
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT referred_by FROM accounts WHERE id = $1")
            .bind(referred.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("account", referred))?;
        if row.try_get::<Option<Uuid>, _>("referred_by")?.is_some() {
            tx.rollback().await?;
            return Ok(ReferralOutcome::AlreadyReferred);
        }

        let Some(row) = sqlx::query("SELECT id FROM accounts WHERE referral_code = $1")
            .bind(code)
            .fetch_optional(&mut *tx)
            .await?
        else {
            tx.rollback().await?;
            return Ok(ReferralOutcome::InvalidCode);
        };
        let referrer = AccountId::from_uuid(row.try_get("id")?);
        if referrer == *referred {
            tx.rollback().await?;
            return Ok(ReferralOutcome::SelfReferral);
        }

        // Zero rows means a concurrent redemption won.
        let claimed = sqlx::query(
            "UPDATE accounts SET referred_by = $2, updated_at = now() \
             WHERE id = $1 AND referred_by IS NULL",
        )
        .bind(referred.as_uuid())
        .bind(referrer.as_uuid())
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(ReferralOutcome::AlreadyReferred);
        }

        let event = ReferralEvent::new(referrer, *referred, code.to_string(), bonus);
        let referrer_entry =
            grant_bonus(&mut tx, &referrer, bonus.referrer, &event.referrer_reason()).await?;
        let referred_entry =
            grant_bonus(&mut tx, referred, bonus.referred, &event.referred_reason()).await?;
        sqlx::query(
            "INSERT INTO referral_events \
             (id, referrer_id, referred_id, code, referrer_bonus, referred_bonus, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(event.id.to_string())
        .bind(event.referrer_id.as_uuid())
        .bind(event.referred_id.as_uuid())
        .bind(&event.code)
        .bind(event.referrer_bonus)
        .bind(event.referred_bonus)
        .bind(event.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(ReferralOutcome::Applied {
            event,
            referrer_entry,
            referred_entry,
        })
    }

    async fn referral_stats(&self, referrer: &AccountId) -> Result<ReferralStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS referral_count, COALESCE(SUM(referrer_bonus), 0)::BIGINT AS earned \
             FROM referral_events WHERE referrer_id = $1",
        )
        .bind(referrer.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(ReferralStats {
            referral_count: u64::try_from(row.try_get::<i64, _>("referral_count")?).unwrap_or(0),
            total_bonus_earned: row.try_get("earned")?,
        })
    }

    async fn list_referrals(&self, referrer: &AccountId) -> Result<Vec<ReferralEvent>> {
        let sql = format!(
            "SELECT {REFERRAL_COLUMNS} FROM referral_events WHERE referrer_id = $1 ORDER BY id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(referrer.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(referral_from_row).collect()
    }

    // =========================================================================
    // Settings
    // =========================================================================

    async fn list_settings(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("key")?, row.try_get("value")?)))
            .collect()
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use creditline_core::{EnhancementMode, SkinEnhancement};

    async fn store() -> PgStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        PgStore::connect(&url, 5).await.unwrap()
    }

    async fn funded(store: &PgStore, balance: i64) -> AccountId {
        let id = AccountId::generate();
        store.create_account(&Account::new(id, None)).await.unwrap();
        store.add(&id, balance, "seed").await.unwrap();
        id
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn conditional_deduct_guards_overdraft() {
        let store = store().await;
        let id = funded(&store, 100).await;

        let tasks = (0..10).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.deduct(&id, 30, "race").await.unwrap() })
        });
        let successes = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Some(_))))
            .count();

        assert_eq!(successes, 3);
        let account = store.get_account(&id).await.unwrap().unwrap();
        assert_eq!(account.balance, 10);
        let entries = store.ledger_for_account(&id).await.unwrap();
        assert_eq!(
            creditline_core::reconstruct_balance(account.opening_balance, &entries),
            10
        );
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn failed_job_round_trip() {
        let store = store().await;
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

        let update = store.fail_job(&job.id, "provider error").await.unwrap();
        assert_eq!(update.transition, Transition::Apply);
        let again = store.fail_job(&job.id, "late").await.unwrap();
        assert_eq!(again.transition, Transition::AlreadyApplied);

        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.payload, job.payload);
        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, 100);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn referral_claim_is_single_use() {
        let store = store().await;
        let referrer = funded(&store, 1).await;
        let referred = funded(&store, 1).await;
        let code = format!("{:08}", referrer.as_uuid().as_u128() % 100_000_000);
        store.assign_referral_code(&referrer, &code).await.unwrap();

        let first = store
            .apply_referral(&referred, &code, ReferralBonus::default())
            .await
            .unwrap();
        let second = store
            .apply_referral(&referred, &code, ReferralBonus::default())
            .await
            .unwrap();
        assert!(matches!(first, ReferralOutcome::Applied { .. }));
        assert_eq!(second, ReferralOutcome::AlreadyReferred);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn concurrent_redemptions_apply_once() {
        let store = store().await;
        let referrer = funded(&store, 1).await;
        let referred = funded(&store, 1).await;
        let code = format!("{:08}", referred.as_uuid().as_u128() % 100_000_000);
        store.assign_referral_code(&referrer, &code).await.unwrap();

        let tasks = (0..2).map(|_| {
            let store = store.clone();
            let code = code.clone();
            tokio::spawn(async move {
                store
                    .apply_referral(&referred, &code, ReferralBonus::default())
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
        assert_eq!(store.get_account(&referrer).await.unwrap().unwrap().balance, 51);
        assert_eq!(store.get_account(&referred).await.unwrap().unwrap().balance, 21);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn zero_bonus_and_overflow() {
        let store = store().await;
        let referrer = funded(&store, 1).await;
        let referred = funded(&store, 1).await;
        let code = format!("{:08}", referrer.as_uuid().as_u128() % 100_000_000);
        store.assign_referral_code(&referrer, &code).await.unwrap();

        let bonus = ReferralBonus {
            referrer: 50,
            referred: 0,
        };
        let outcome = store.apply_referral(&referred, &code, bonus).await.unwrap();
        assert!(matches!(
            outcome,
            ReferralOutcome::Applied {
                referred_entry: None,
                ..
            }
        ));
        assert_eq!(store.get_account(&referred).await.unwrap().unwrap().balance, 1);

        store.add(&referrer, i64::MAX - 51, "fill").await.unwrap();
        assert!(matches!(
            store.add(&referrer, 1, "overflow").await,
            Err(StoreError::InvalidAmount(1))
        ));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn open_account_grants_signup_bonus_once() {
        let store = store().await;
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
    }
}
