//! Column families of the `RocksDB` backend.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Account records, keyed by account id.
    pub const ACCOUNTS: &str = "accounts";

    /// Index: referral code to account id.
    pub const REFERRAL_CODES: &str = "referral_codes";

    /// Ledger entries, keyed by entry id (ULID).
    pub const LEDGER: &str = "ledger";

    /// Index: `account_id || seq` to entry id. `seq` is a global append
    /// counter, so the index keeps exact insertion order per account.
    pub const LEDGER_BY_ACCOUNT: &str = "ledger_by_account";

    /// Payment orders, keyed by order id (ULID).
    pub const ORDERS: &str = "orders";

    /// Index: `provider:external_order_id` to order id. Enforces uniqueness.
    pub const ORDERS_BY_EXTERNAL: &str = "orders_by_external";

    /// Index: `provider:payment_ref` to order id.
    pub const ORDERS_BY_PAYMENT_REF: &str = "orders_by_payment_ref";

    /// Index: `account_id || order_id`, empty value.
    pub const ORDERS_BY_ACCOUNT: &str = "orders_by_account";

    /// Generation jobs, keyed by job id (ULID).
    pub const JOBS: &str = "jobs";

    /// Index: `account_id || job_id`, empty value.
    pub const JOBS_BY_ACCOUNT: &str = "jobs_by_account";

    /// Index: provider task id to job id.
    pub const JOBS_BY_TASK: &str = "jobs_by_task";

    /// Index: ids of jobs not yet terminal, empty value.
    pub const JOBS_ACTIVE: &str = "jobs_active";

    /// Referral events, keyed by event id (ULID).
    pub const REFERRALS: &str = "referrals";

    /// Index: `referrer_id || event_id`, empty value.
    pub const REFERRALS_BY_REFERRER: &str = "referrals_by_referrer";

    /// Runtime settings, UTF-8 key to UTF-8 value.
    pub const SETTINGS: &str = "settings";

    /// Counters.
    pub const META: &str = "meta";
}

/// Key of the ledger append counter in [`cf::META`].
pub const LEDGER_SEQ_KEY: &[u8] = b"ledger_seq";

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::ACCOUNTS,
        cf::REFERRAL_CODES,
        cf::LEDGER,
        cf::LEDGER_BY_ACCOUNT,
        cf::ORDERS,
        cf::ORDERS_BY_EXTERNAL,
        cf::ORDERS_BY_PAYMENT_REF,
        cf::ORDERS_BY_ACCOUNT,
        cf::JOBS,
        cf::JOBS_BY_ACCOUNT,
        cf::JOBS_BY_TASK,
        cf::JOBS_ACTIVE,
        cf::REFERRALS,
        cf::REFERRALS_BY_REFERRER,
        cf::SETTINGS,
        cf::META,
    ]
}
