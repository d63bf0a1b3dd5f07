//! Runtime settings with a time-bounded cache.
//!
//! Settings live in the store's settings table and are edited by admins.
//! Reads go through [`SettingsCache`], which refetches the whole table once
//! the TTL has elapsed or after [`SettingsCache::invalidate`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use creditline_core::referral::{DEFAULT_REFERRED_BONUS, DEFAULT_REFERRER_BONUS};
use creditline_core::ReferralBonus;
use creditline_store::{Result, Store};

/// Credits granted to every new account.
pub const SIGNUP_BONUS_CREDITS: &str = "signup_bonus_credits";
/// `true`/`false`: whether referral codes can be redeemed.
pub const REFERRAL_SYSTEM_ENABLED: &str = "referral_system_enabled";
/// Credits for the owner of a redeemed code.
pub const REFERRAL_BONUS_REFERRER: &str = "referral_bonus_referrer";
/// Credits for the account redeeming a code.
pub const REFERRAL_BONUS_REFERRED: &str = "referral_bonus_referred";

/// Default signup bonus.
pub const DEFAULT_SIGNUP_BONUS: i64 = 25;

#[derive(Debug, Default)]
struct Snapshot {
    values: HashMap<String, String>,
    fetched_at: Option<Instant>,
}

/// Cached view of the settings table.
pub struct SettingsCache {
    store: Arc<dyn Store>,
    ttl: Duration,
    snapshot: RwLock<Snapshot>,
}

impl SettingsCache {
    /// Create an empty cache; the first read fetches from the store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    /// Read one setting, refreshing first if the cache is stale.
    ///
    /// # Errors
    ///
    /// Returns an error if a refresh was needed and the store failed.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        {
            let snapshot = self.snapshot.read().await;
            if snapshot.fetched_at.is_some_and(|at| at.elapsed() < self.ttl) {
                return Ok(snapshot.values.get(key).cloned());
            }
        }
        self.refresh().await?;
        Ok(self.snapshot.read().await.values.get(key).cloned())
    }

    /// Refetch every setting from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails; the old snapshot is kept.
    pub async fn refresh(&self) -> Result<usize> {
        let values = self.store.list_settings().await?;
        let count = values.len();
        let mut snapshot = self.snapshot.write().await;
        snapshot.values = values;
        snapshot.fetched_at = Some(Instant::now());
        tracing::debug!(count, "Settings cache refreshed");
        Ok(count)
    }

    /// Mark the cache stale so the next read refetches.
    pub async fn invalidate(&self) {
        self.snapshot.write().await.fetched_at = None;
    }

    /// Write a setting and invalidate the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.store.put_setting(key, value).await?;
        self.invalidate().await;
        Ok(())
    }

    /// Integer setting, falling back to `default` when unset or malformed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn get_i64(&self, key: &str, default: i64) -> Result<i64> {
        Ok(self
            .get(key)
            .await?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default))
    }

    /// Boolean setting (`true`/`false`/`1`/`0`), falling back to `default`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        Ok(match self.get(key).await?.as_deref().map(str::trim) {
            Some("true" | "1") => true,
            Some("false" | "0") => false,
            _ => default,
        })
    }

    /// Credit amount setting. Negative values fall back to `default`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn get_credits(&self, key: &str, default: i64) -> Result<i64> {
        let value = self.get_i64(key, default).await?;
        if value < 0 {
            tracing::warn!(key, value, default, "Negative credit setting ignored");
            return Ok(default);
        }
        Ok(value)
    }

    /// Signup bonus in credits.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn signup_bonus(&self) -> Result<i64> {
        self.get_credits(SIGNUP_BONUS_CREDITS, DEFAULT_SIGNUP_BONUS).await
    }

    /// Whether referral codes can be redeemed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn referral_enabled(&self) -> Result<bool> {
        self.get_bool(REFERRAL_SYSTEM_ENABLED, true).await
    }

    /// Current referral bonuses.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn referral_bonus(&self) -> Result<ReferralBonus> {
        Ok(ReferralBonus {
            referrer: self
                .get_credits(REFERRAL_BONUS_REFERRER, DEFAULT_REFERRER_BONUS)
                .await?,
            referred: self
                .get_credits(REFERRAL_BONUS_REFERRED, DEFAULT_REFERRED_BONUS)
                .await?,
        })
    }
}
