//! Pricing configuration for creditline.
//!
//! Credit packages sold at checkout and the credit price of each generation
//! job kind. Defaults are compiled in; deployments may override the JSON.

use serde::{Deserialize, Serialize};

use crate::{BillingError, Result};

/// Smallest number of images accepted in one batch.
pub const MIN_BATCH_SIZE: usize = 2;

/// Largest number of images accepted in one batch.
pub const MAX_BATCH_SIZE: usize = 10;

/// A purchasable bundle of credits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditPackage {
    /// Stable package identifier used at checkout.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Credits before bonus.
    pub credits: i64,

    /// Bonus percentage applied on settlement.
    pub bonus_percent: i64,

    /// Price in the currency's minor unit (kuruş, cents).
    pub price_minor: i64,

    /// ISO 4217 currency code, lowercase.
    pub currency: String,
}

impl CreditPackage {
    /// Credits granted when an order for this package settles.
    #[must_use]
    pub fn credits_granted(&self) -> i64 {
        crate::payment::granted_credits(self.credits, self.bonus_percent)
    }
}

/// Per-mode prices for skin enhancement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnhancementPricing {
    /// `natural_clean` mode.
    pub natural_clean: i64,
    /// `soft_glow` mode.
    pub soft_glow: i64,
    /// `studio_look` mode.
    pub studio_look: i64,
    /// `no_makeup_real` mode.
    pub no_makeup_real: i64,
    /// Add-on for pro mode.
    pub pro_addon: i64,
    /// Flat price of one batch, before the pro add-on.
    pub batch: i64,
}

/// Pricing configuration for all billable resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Credit packages offered at checkout.
    pub packages: Vec<CreditPackage>,

    /// Skin enhancement prices.
    pub enhancement: EnhancementPricing,

    /// Base price of one generated image.
    pub image_base: i64,

    /// Surcharge per resolution tier: 1K, 2K, 4K.
    pub image_resolution_surcharge: [i64; 3],

    /// Price per second of generated video.
    pub video_per_second: i64,

    /// Longest video accepted, in seconds.
    pub video_max_seconds: u32,

    /// Price per doubling step of an upscale.
    pub upscale_per_step: i64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        let package = |id: &str, name: &str, credits, bonus_percent, price_minor| CreditPackage {
            id: id.to_string(),
            name: name.to_string(),
            credits,
            bonus_percent,
            price_minor,
            currency: "try".to_string(),
        };

        Self {
            packages: vec![
                package("starter", "Starter", 100, 0, 9_900),
                package("popular", "Popular", 300, 10, 24_900),
                package("pro", "Pro", 1_000, 20, 69_900),
                package("studio", "Studio", 3_000, 30, 179_900),
            ],
            enhancement: EnhancementPricing {
                natural_clean: 20,
                soft_glow: 25,
                studio_look: 30,
                no_makeup_real: 25,
                pro_addon: 5,
                batch: 50,
            },
            image_base: 10,
            image_resolution_surcharge: [0, 5, 10],
            video_per_second: 8,
            video_max_seconds: 15,
            upscale_per_step: 10,
        }
    }
}

impl PricingConfig {
    /// Look up a credit package by id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if no package has that id.
    pub fn package(&self, id: &str) -> Result<&CreditPackage> {
        self.packages
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| BillingError::InvalidRequest(format!("unknown package: {id}")))
    }

    /// Price of a batch of `size` skin enhancements.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if `size` is outside the accepted range.
    pub fn batch_price(&self, size: usize, pro_mode: bool) -> Result<i64> {
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&size) {
            return Err(BillingError::InvalidRequest(format!(
                "batch size must be between {MIN_BATCH_SIZE} and {MAX_BATCH_SIZE}, got {size}"
            )));
        }
        let addon = if pro_mode { self.enhancement.pro_addon } else { 0 };
        Ok(self.enhancement.batch + addon)
    }
}
