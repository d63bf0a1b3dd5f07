//! Service configuration.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use creditline_core::PricingConfig;

/// Storage backend selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// PostgreSQL through `DATABASE_URL`.
    Postgres,
    /// Process-local store; state is lost on restart.
    Memory,
    /// Embedded `RocksDB` under `DATA_DIR`.
    RocksDb,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            "rocksdb" | "rocks" => Ok(Self::RocksDb),
            other => Err(format!("unknown storage backend: {other}")),
        }
    }
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Storage backend. Defaults to Postgres when `DATABASE_URL` is set,
    /// memory otherwise.
    pub storage_backend: StorageBackend,

    /// PostgreSQL connection string.
    pub database_url: Option<String>,

    /// Maximum pooled Postgres connections (default: 10).
    pub database_max_connections: u32,

    /// Path to the `RocksDB` data directory (default: "/data/creditline").
    pub data_dir: String,

    /// HS256 secret for user JWTs. Without it every user request is rejected.
    pub auth_jwt_secret: Option<String>,

    /// Expected JWT audience, if any.
    pub auth_audience: Option<String>,

    /// Admin API key for `/v1/admin` endpoints.
    pub admin_api_key: Option<String>,

    /// Stripe secret API key.
    pub stripe_api_key: Option<String>,

    /// Stripe webhook signing secret (`whsec_...`).
    pub stripe_webhook_secret: Option<String>,

    /// Maximum age of a Stripe signature timestamp (default: 300s).
    pub stripe_webhook_tolerance_seconds: u64,

    /// Stripe API base URL (default: `https://api.stripe.com/v1`).
    pub stripe_api_base: String,

    /// Shopier merchant API key.
    pub shopier_api_key: Option<String>,

    /// Shopier merchant API secret, used to sign payment forms.
    pub shopier_api_secret: Option<String>,

    /// Shopier OSB username, sent back as `API_key` in callbacks.
    pub shopier_osb_username: Option<String>,

    /// Shopier OSB password, sent back as `API_secret` in callbacks.
    pub shopier_osb_password: Option<String>,

    /// Shopier payment form action URL.
    pub shopier_payment_url: String,

    /// Public base URL of this service, used for provider return URLs.
    pub public_url: String,

    /// Frontend URL for checkout redirects.
    pub frontend_url: String,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Generation provider base URL.
    pub provider_base_url: Option<String>,

    /// Generation provider API key.
    pub provider_api_key: Option<String>,

    /// Secret for HMAC-signed provider callbacks.
    pub provider_callback_secret: Option<String>,

    /// Budget for one provider submission (default: 120s).
    pub provider_timeout_seconds: u64,

    /// How often the job poller runs (default: 30s).
    pub job_poll_interval_seconds: u64,

    /// Age after which a processing job is failed and refunded (default: 1800s).
    pub job_max_age_seconds: u64,

    /// Settings cache TTL (default: 60s).
    pub settings_cache_ttl_seconds: u64,

    /// Pricing configuration.
    pub pricing: PricingConfig,
}

/// Stripe secrets file structure.
#[derive(Debug, Deserialize)]
struct StripeSecrets {
    api_key: String,
    #[serde(default)]
    webhook_secret: Option<String>,
}

/// Shopier secrets file structure.
#[derive(Debug, Deserialize)]
struct ShopierSecrets {
    api_key: String,
    #[serde(default)]
    api_secret: Option<String>,
    #[serde(default)]
    osb_username: Option<String>,
    #[serde(default)]
    osb_password: Option<String>,
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env(key).and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let (stripe_api_key, stripe_webhook_secret) = load_stripe_secrets();
        let shopier = load_shopier_secrets();

        let database_url = env("DATABASE_URL");
        let storage_backend = env("STORAGE_BACKEND")
            .and_then(|s| match s.parse::<StorageBackend>() {
                Ok(backend) => Some(backend),
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring STORAGE_BACKEND");
                    None
                }
            })
            .unwrap_or(if database_url.is_some() {
                StorageBackend::Postgres
            } else {
                StorageBackend::Memory
            });

        Self {
            listen_addr: env_or("LISTEN_ADDR", &defaults.listen_addr),
            storage_backend,
            database_url,
            database_max_connections: env_parse(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            ),
            data_dir: env_or("DATA_DIR", &defaults.data_dir),
            auth_jwt_secret: env("AUTH_JWT_SECRET"),
            auth_audience: env("AUTH_AUDIENCE"),
            admin_api_key: env("ADMIN_API_KEY"),
            stripe_api_key,
            stripe_webhook_secret,
            stripe_webhook_tolerance_seconds: env_parse(
                "STRIPE_WEBHOOK_TOLERANCE_SECONDS",
                defaults.stripe_webhook_tolerance_seconds,
            ),
            stripe_api_base: env_or("STRIPE_API_BASE", &defaults.stripe_api_base),
            shopier_api_key: shopier.api_key,
            shopier_api_secret: shopier.api_secret,
            shopier_osb_username: shopier.osb_username,
            shopier_osb_password: shopier.osb_password,
            shopier_payment_url: env_or("SHOPIER_PAYMENT_URL", &defaults.shopier_payment_url),
            public_url: env_or("PUBLIC_URL", &defaults.public_url),
            frontend_url: env_or("FRONTEND_URL", &defaults.frontend_url),
            cors_origins: env_or("CORS_ORIGINS", "*")
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parse("MAX_BODY_BYTES", defaults.max_body_bytes),
            request_timeout_seconds: env_parse(
                "REQUEST_TIMEOUT_SECONDS",
                defaults.request_timeout_seconds,
            ),
            provider_base_url: env("PROVIDER_BASE_URL"),
            provider_api_key: env("PROVIDER_API_KEY"),
            provider_callback_secret: env("PROVIDER_CALLBACK_SECRET"),
            provider_timeout_seconds: env_parse(
                "PROVIDER_TIMEOUT_SECONDS",
                defaults.provider_timeout_seconds,
            ),
            job_poll_interval_seconds: env_parse(
                "JOB_POLL_INTERVAL_SECONDS",
                defaults.job_poll_interval_seconds,
            ),
            job_max_age_seconds: env_parse("JOB_MAX_AGE_SECONDS", defaults.job_max_age_seconds),
            settings_cache_ttl_seconds: env_parse(
                "SETTINGS_CACHE_TTL_SECONDS",
                defaults.settings_cache_ttl_seconds,
            ),
            pricing: PricingConfig::default(),
        }
    }

    /// Provider submission budget.
    #[must_use]
    pub const fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_seconds)
    }

    /// Job poller interval.
    #[must_use]
    pub const fn job_poll_interval(&self) -> Duration {
        Duration::from_secs(self.job_poll_interval_seconds)
    }

    /// Maximum age of a processing job.
    #[must_use]
    pub const fn job_max_age(&self) -> Duration {
        Duration::from_secs(self.job_max_age_seconds)
    }

    /// Settings cache TTL.
    #[must_use]
    pub const fn settings_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.settings_cache_ttl_seconds)
    }
}

const SECRETS_DIRS: [&str; 3] = [".secrets", "creditline/.secrets", "../.secrets"];

/// Load Stripe secrets from file or environment.
fn load_stripe_secrets() -> (Option<String>, Option<String>) {
    for dir in &SECRETS_DIRS {
        let path = format!("{dir}/stripe.json");
        if let Ok(secrets) = load_secrets_file::<StripeSecrets>(&path) {
            tracing::info!(path = %path, "Loaded Stripe secrets from file");
            return (Some(secrets.api_key), secrets.webhook_secret);
        }
    }

    tracing::debug!("Stripe secrets file not found, using environment variables");
    (env("STRIPE_API_KEY"), env("STRIPE_WEBHOOK_SECRET"))
}

#[derive(Debug, Default)]
struct ShopierCredentials {
    api_key: Option<String>,
    api_secret: Option<String>,
    osb_username: Option<String>,
    osb_password: Option<String>,
}

/// Load Shopier secrets from file or environment.
fn load_shopier_secrets() -> ShopierCredentials {
    for dir in &SECRETS_DIRS {
        let path = format!("{dir}/shopier.json");
        if let Ok(secrets) = load_secrets_file::<ShopierSecrets>(&path) {
            tracing::info!(path = %path, "Loaded Shopier secrets from file");
            return ShopierCredentials {
                api_key: Some(secrets.api_key),
                api_secret: secrets.api_secret,
                osb_username: secrets.osb_username,
                osb_password: secrets.osb_password,
            };
        }
    }

    tracing::debug!("Shopier secrets file not found, using environment variables");
    ShopierCredentials {
        api_key: env("SHOPIER_API_KEY"),
        api_secret: env("SHOPIER_API_SECRET"),
        osb_username: env("SHOPIER_OSB_USERNAME"),
        osb_password: env("SHOPIER_OSB_PASSWORD"),
    }
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            storage_backend: StorageBackend::Memory,
            database_url: None,
            database_max_connections: 10,
            data_dir: "/data/creditline".into(),
            auth_jwt_secret: None,
            auth_audience: None,
            admin_api_key: None,
            stripe_api_key: None,
            stripe_webhook_secret: None,
            stripe_webhook_tolerance_seconds: 300,
            stripe_api_base: "https://api.stripe.com/v1".into(),
            shopier_api_key: None,
            shopier_api_secret: None,
            shopier_osb_username: None,
            shopier_osb_password: None,
            shopier_payment_url: "https://www.shopier.com/ShowProduct/api_pay4.php".into(),
            public_url: "http://localhost:8080".into(),
            frontend_url: "http://localhost:3000".into(),
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
            provider_base_url: None,
            provider_api_key: None,
            provider_callback_secret: None,
            provider_timeout_seconds: 120,
            job_poll_interval_seconds: 30,
            job_max_age_seconds: 1800,
            settings_cache_ttl_seconds: 60,
            pricing: PricingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_backend_parses_aliases() {
        assert_eq!("Postgres".parse::<StorageBackend>(), Ok(StorageBackend::Postgres));
        assert_eq!("rocks".parse::<StorageBackend>(), Ok(StorageBackend::RocksDb));
        assert_eq!("memory".parse::<StorageBackend>(), Ok(StorageBackend::Memory));
        assert!("mysql".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ServiceConfig::default();
        assert_eq!(config.provider_timeout(), Duration::from_secs(120));
        assert_eq!(config.job_poll_interval(), Duration::from_secs(30));
        assert_eq!(config.job_max_age(), Duration::from_secs(1800));
        assert_eq!(config.stripe_webhook_tolerance_seconds, 300);
    }
}
