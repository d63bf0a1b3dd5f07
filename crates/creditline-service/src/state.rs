//! Application state.

use std::sync::Arc;
use std::time::Duration;

use creditline_store::Store;

use crate::config::ServiceConfig;
use crate::credits::CreditGuard;
use crate::jobs::{GenerationProvider, HttpGenerationProvider, JobEngine, JobPoller};
use crate::payments::PaymentIntake;
use crate::referral::ReferralService;
use crate::settings::SettingsCache;
use crate::shopier::ShopierGateway;
use crate::stripe::StripeClient;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The storage backend.
    pub store: Arc<dyn Store>,

    /// Service configuration.
    pub config: ServiceConfig,

    /// Runtime settings.
    pub settings: Arc<SettingsCache>,

    /// Credit primitives.
    pub credits: CreditGuard,

    /// Checkout and payment notifications.
    pub payments: PaymentIntake,

    /// Generation jobs.
    pub jobs: JobEngine,

    /// Referral codes.
    pub referrals: ReferralService,
}

impl AppState {
    /// Create the state, building the generation provider from config.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Self {
        let provider = config.provider_base_url.as_ref().and_then(|url| {
            match HttpGenerationProvider::new(
                url,
                config.provider_api_key.clone(),
                config.provider_timeout(),
            ) {
                Ok(provider) => {
                    tracing::info!(provider_url = %url, "Generation provider enabled");
                    Some(Arc::new(provider) as Arc<dyn GenerationProvider>)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create generation provider client");
                    None
                }
            }
        });

        if provider.is_none() {
            tracing::warn!("Generation provider not configured - jobs will fail and refund");
        }

        Self::with_generation_provider(store, config, provider)
    }

    /// Create the state with an explicit generation provider.
    #[must_use]
    pub fn with_generation_provider(
        store: Arc<dyn Store>,
        config: ServiceConfig,
        provider: Option<Arc<dyn GenerationProvider>>,
    ) -> Self {
        let stripe = config.stripe_api_key.as_ref().and_then(|key| {
            match StripeClient::new(key, config.stripe_webhook_secret.clone()) {
                Ok(client) => {
                    tracing::info!("Stripe integration enabled");
                    Some(Arc::new(
                        client
                            .with_base_url(&config.stripe_api_base)
                            .with_tolerance(Duration::from_secs(
                                config.stripe_webhook_tolerance_seconds,
                            )),
                    ))
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create Stripe client");
                    None
                }
            }
        });

        if stripe.is_none() {
            tracing::warn!("Stripe not configured - Stripe payments will not be available");
        }

        let shopier = config.shopier_api_key.as_ref().map(|key| {
            tracing::info!("Shopier integration enabled");
            Arc::new(
                ShopierGateway::new(
                    key,
                    config.shopier_api_secret.clone().unwrap_or_default(),
                    &config.shopier_payment_url,
                    format!("{}/payments/shopier/return", config.public_url.trim_end_matches('/')),
                )
                .with_osb_credentials(
                    config.shopier_osb_username.clone(),
                    config.shopier_osb_password.clone(),
                ),
            )
        });

        let pricing = Arc::new(config.pricing.clone());
        let settings = Arc::new(SettingsCache::new(store.clone(), config.settings_cache_ttl()));
        let credits = CreditGuard::new(store.clone());
        let payments = PaymentIntake::new(
            store.clone(),
            pricing.clone(),
            stripe,
            shopier,
            &config.frontend_url,
        );
        let jobs = JobEngine::new(
            store.clone(),
            credits.clone(),
            provider,
            pricing,
            config.provider_timeout(),
        );
        let referrals = ReferralService::new(store.clone(), settings.clone());

        Self {
            store,
            config,
            settings,
            credits,
            payments,
            jobs,
            referrals,
        }
    }

    /// Background poller for jobs awaiting a provider result.
    #[must_use]
    pub fn job_poller(&self) -> JobPoller {
        JobPoller::new(
            self.jobs.clone(),
            self.store.clone(),
            self.config.job_poll_interval(),
            self.config.job_max_age(),
        )
    }
}
