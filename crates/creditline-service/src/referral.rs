//! Referral codes and redemption.

use std::sync::Arc;

use rand::Rng;
use serde::Serialize;

use creditline_core::referral::{
    is_well_formed, normalize_code, REFERRAL_CODE_ALPHABET, REFERRAL_CODE_LEN,
};
use creditline_core::{AccountId, BillingError, ReferralEvent, ReferralStats, Result};
use creditline_store::Store;

use crate::settings::SettingsCache;

/// Attempts at drawing an unused code before giving up.
const CODE_ATTEMPTS: usize = 10;

/// Public view of a code, for the validate endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CodeValidation {
    /// The normalized code.
    pub code: String,
    /// Whether an account owns it.
    pub valid: bool,
}

/// Referral summary for one account.
#[derive(Debug, Clone, Serialize)]
pub struct ReferralInfo {
    /// The account's own code, if generated.
    pub code: Option<String>,
    /// Whether the account redeemed someone's code.
    pub referred: bool,
    /// Who referred the account.
    pub referred_by: Option<AccountId>,
    /// Whether redemption is currently enabled.
    pub enabled: bool,
    /// Bonus for the referrer.
    pub referrer_bonus: i64,
    /// Bonus for the referred account.
    pub referred_bonus: i64,
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..REFERRAL_CODE_LEN)
        .map(|_| char::from(REFERRAL_CODE_ALPHABET[rng.gen_range(0..REFERRAL_CODE_ALPHABET.len())]))
        .collect()
}

/// Issues codes and settles redemptions.
#[derive(Clone)]
pub struct ReferralService {
    store: Arc<dyn Store>,
    settings: Arc<SettingsCache>,
}

impl ReferralService {
    /// Create the service.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, settings: Arc<SettingsCache>) -> Self {
        Self { store, settings }
    }

    /// The account's code, generating and storing one on first use.
    ///
    /// # Errors
    ///
    /// - `AccountNotFound` for an unknown account.
    /// - `Storage` if no free code was found after several attempts.
    pub async fn code_for(&self, account_id: &AccountId) -> Result<String> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| BillingError::AccountNotFound {
                account_id: account_id.to_string(),
            })?;
        if let Some(code) = account.referral_code {
            return Ok(code);
        }

        for attempt in 1..=CODE_ATTEMPTS {
            let candidate = generate_code();
            if let Some(code) = self.store.assign_referral_code(account_id, &candidate).await? {
                tracing::info!(account_id = %account_id, code = %code, "Referral code issued");
                return Ok(code);
            }
            tracing::debug!(attempt, "Referral code collision");
        }

        Err(BillingError::Storage(format!(
            "no free referral code after {CODE_ATTEMPTS} attempts"
        )))
    }

    /// Whether `code` belongs to an account.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lookup fails.
    pub async fn validate(&self, code: &str) -> Result<CodeValidation> {
        let code = normalize_code(code);
        let valid = is_well_formed(&code)
            && self.store.find_account_by_referral_code(&code).await?.is_some();
        Ok(CodeValidation { code, valid })
    }

    /// Redeem `code` for `account_id`, crediting both sides once.
    ///
    /// # Errors
    ///
    /// - `ReferralDisabled` while redemption is switched off.
    /// - `InvalidReferralCode` if no account owns the code.
    /// - `SelfReferral` for the caller's own code.
    /// - `AlreadyReferred` if the account already redeemed a code.
    pub async fn apply(&self, account_id: &AccountId, code: &str) -> Result<ReferralEvent> {
        if !self.settings.referral_enabled().await? {
            return Err(BillingError::ReferralDisabled);
        }

        let code = normalize_code(code);
        if !is_well_formed(&code) {
            return Err(BillingError::InvalidReferralCode { code });
        }

        let bonus = self.settings.referral_bonus().await?;
        let outcome = self.store.apply_referral(account_id, &code, bonus).await?;
        let event = outcome.into_result(&code).map_err(|e| {
            tracing::info!(account_id = %account_id, code = %code, reason = %e, "Referral refused");
            e
        })?;

        tracing::info!(
            referrer_id = %event.referrer_id,
            referred_id = %event.referred_id,
            referrer_bonus = event.referrer_bonus,
            referred_bonus = event.referred_bonus,
            "Referral applied"
        );
        Ok(event)
    }

    /// Totals for the account as a referrer.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lookup fails.
    pub async fn stats(&self, account_id: &AccountId) -> Result<ReferralStats> {
        Ok(self.store.referral_stats(account_id).await?)
    }

    /// Redemptions of the account's code, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lookup fails.
    pub async fn history(&self, account_id: &AccountId) -> Result<Vec<ReferralEvent>> {
        Ok(self.store.list_referrals(account_id).await?)
    }

    /// Code, referral status and current bonuses.
    ///
    /// # Errors
    ///
    /// Returns `AccountNotFound` for an unknown account.
    pub async fn info(&self, account_id: &AccountId) -> Result<ReferralInfo> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| BillingError::AccountNotFound {
                account_id: account_id.to_string(),
            })?;
        let bonus = self.settings.referral_bonus().await?;
        Ok(ReferralInfo {
            referred: account.is_referred(),
            code: account.referral_code,
            referred_by: account.referred_by,
            enabled: self.settings.referral_enabled().await?,
            referrer_bonus: bonus.referrer,
            referred_bonus: bonus.referred,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use creditline_core::Account;
    use creditline_store::MemoryStore;

    use crate::settings::REFERRAL_SYSTEM_ENABLED;

    async fn service() -> (ReferralService, Arc<MemoryStore>, AccountId, AccountId) {
        let store = Arc::new(MemoryStore::new());
        let referrer = AccountId::generate();
        let referred = AccountId::generate();
        store.create_account(&Account::new(referrer, None)).await.unwrap();
        store.create_account(&Account::new(referred, None)).await.unwrap();
        let settings = Arc::new(SettingsCache::new(store.clone(), Duration::ZERO));
        (ReferralService::new(store.clone(), settings), store, referrer, referred)
    }

    #[test]
    fn generated_codes_are_well_formed() {
        for _ in 0..50 {
            assert!(is_well_formed(&generate_code()));
        }
    }

    #[tokio::test]
    async fn code_is_stable_once_issued() {
        let (service, _store, referrer, _) = service().await;
        let first = service.code_for(&referrer).await.unwrap();
        let second = service.code_for(&referrer).await.unwrap();
        assert_eq!(first, second);
        assert!(service.validate(&first.to_lowercase()).await.unwrap().valid);
    }

    #[tokio::test]
    async fn redemption_is_one_shot() {
        let (service, store, referrer, referred) = service().await;
        let code = service.code_for(&referrer).await.unwrap();

        service.apply(&referred, &code.to_lowercase()).await.unwrap();
        let again = service.apply(&referred, &code).await.unwrap_err();
        assert!(matches!(again, BillingError::AlreadyReferred));

        let balance = |id| {
            let store = store.clone();
            async move { store.get_account(&id).await.unwrap().unwrap().balance }
        };
        assert_eq!(balance(referrer).await, 50);
        assert_eq!(balance(referred).await, 20);
        assert_eq!(service.stats(&referrer).await.unwrap().referral_count, 1);
    }

    #[tokio::test]
    async fn own_code_is_refused() {
        let (service, _store, referrer, _) = service().await;
        let code = service.code_for(&referrer).await.unwrap();
        let err = service.apply(&referrer, &code).await.unwrap_err();
        assert!(matches!(err, BillingError::SelfReferral));
    }

    #[tokio::test]
    async fn disabled_system_refuses() {
        let (service, store, referrer, referred) = service().await;
        let code = service.code_for(&referrer).await.unwrap();
        store.put_setting(REFERRAL_SYSTEM_ENABLED, "false").await.unwrap();

        let err = service.apply(&referred, &code).await.unwrap_err();
        assert!(matches!(err, BillingError::ReferralDisabled));
    }

    #[tokio::test]
    async fn malformed_code_is_invalid() {
        let (service, _store, _, referred) = service().await;
        let err = service.apply(&referred, "nope").await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidReferralCode { .. }));
    }
}
