//! Common test utilities for creditline integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum_test::TestServer;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;

use creditline_core::{AccountId, GenerationJob};
use creditline_service::jobs::{GenerationProvider, ProviderError, Submission, TaskStatus};
use creditline_service::{create_router, AppState, ServiceConfig};
use creditline_store::{MemoryStore, Store};

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const ADMIN_KEY: &str = "test-admin-key";
pub const STRIPE_WEBHOOK_SECRET: &str = "whsec_test";
pub const PROVIDER_CALLBACK_SECRET: &str = "provider-callback-secret";
pub const OSB_USERNAME: &str = "osb-user";
pub const OSB_PASSWORD: &str = "osb-pass";

/// What the scripted provider answers to every submission.
#[derive(Debug, Clone)]
pub enum Scripted {
    Complete(String),
    Fail(String),
    Accept(String),
    Error,
}

#[async_trait]
impl GenerationProvider for Scripted {
    async fn submit(&self, _job: &GenerationJob) -> Result<Submission, ProviderError> {
        match self {
            Self::Complete(url) => Ok(Submission::Completed {
                result_url: url.clone(),
            }),
            Self::Fail(error) => Ok(Submission::Failed {
                error: error.clone(),
            }),
            Self::Accept(task_id) => Ok(Submission::Accepted {
                task_id: task_id.clone(),
            }),
            Self::Error => Err(ProviderError::Api {
                status: 500,
                message: "upstream exploded".into(),
            }),
        }
    }

    async fn poll(&self, _task_id: &str) -> Result<TaskStatus, ProviderError> {
        Ok(TaskStatus::Pending)
    }
}

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// Direct store access for assertions.
    pub store: Arc<MemoryStore>,
    /// The primary test account.
    pub account_id: AccountId,
}

impl TestHarness {
    /// Harness without a generation provider or Stripe API.
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// Harness whose jobs are answered by `provider`.
    pub fn with_provider(provider: Scripted) -> Self {
        Self::build(Some(provider), None)
    }

    /// Harness whose Stripe API calls go to `base_url`.
    pub fn with_stripe_api(base_url: &str) -> Self {
        Self::build(None, Some(base_url))
    }

    fn build(provider: Option<Scripted>, stripe_base: Option<&str>) -> Self {
        let store = Arc::new(MemoryStore::new());

        let config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            auth_jwt_secret: Some(JWT_SECRET.into()),
            admin_api_key: Some(ADMIN_KEY.into()),
            stripe_api_key: Some("sk_test_123".into()),
            stripe_webhook_secret: Some(STRIPE_WEBHOOK_SECRET.into()),
            stripe_api_base: stripe_base.unwrap_or("http://127.0.0.1:9").to_string(),
            shopier_api_key: Some("shopier-key".into()),
            shopier_api_secret: Some("shopier-secret".into()),
            shopier_osb_username: Some(OSB_USERNAME.into()),
            shopier_osb_password: Some(OSB_PASSWORD.into()),
            public_url: "https://api.example.com".into(),
            frontend_url: "https://app.example.com".into(),
            provider_callback_secret: Some(PROVIDER_CALLBACK_SECRET.into()),
            provider_timeout_seconds: 5,
            ..ServiceConfig::default()
        };

        let provider = provider.map(|p| Arc::new(p) as Arc<dyn GenerationProvider>);
        let state = AppState::with_generation_provider(store.clone(), config, provider);
        let router: Router = create_router(state);

        let server = TestServer::new(router).expect("Failed to create test server");

        Self {
            server,
            store,
            account_id: AccountId::generate(),
        }
    }

    /// Bearer header for the primary account.
    pub fn user_auth_header(&self) -> String {
        auth_header_for(&self.account_id)
    }

    /// Create the primary account (signup bonus included).
    pub async fn create_account(&self) {
        create_account_for(&self.server, &self.account_id).await;
    }

    /// Create the primary account and bring its balance to exactly `balance`.
    pub async fn create_funded_account(&self, balance: i64) {
        self.create_account().await;
        let current = self.balance().await;
        let (path, amount) = if balance >= current {
            ("/v1/admin/credits/add", balance - current)
        } else {
            ("/v1/admin/credits/deduct", current - balance)
        };
        if amount > 0 {
            self.server
                .post(path)
                .add_header("x-admin-key", ADMIN_KEY)
                .json(&json!({
                    "account_id": self.account_id.to_string(),
                    "amount": amount,
                    "reason": "test funding"
                }))
                .await
                .assert_status_ok();
        }
    }

    /// Current balance of the primary account.
    pub async fn balance(&self) -> i64 {
        self.store
            .get_account(&self.account_id)
            .await
            .expect("store read")
            .expect("account exists")
            .balance
    }

    /// Poll a job over HTTP until it leaves the in-flight states.
    pub async fn wait_for_job(&self, job_id: &str) -> serde_json::Value {
        for _ in 0..100 {
            let response = self
                .server
                .get(&format!("/v1/jobs/{job_id}"))
                .add_header("authorization", self.user_auth_header())
                .await;
            response.assert_status_ok();
            let job: serde_json::Value = response.json();
            let status = job["status"].as_str().unwrap_or_default();
            if status != "pending" && status != "processing" {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} did not settle");
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Mint an HS256 token for `account_id`.
pub fn token_for(account_id: &AccountId) -> String {
    let claims = json!({
        "sub": account_id.to_string(),
        "email": format!("{account_id}@example.com"),
        "exp": chrono::Utc::now().timestamp() + 3600,
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("encode token")
}

/// Bearer header for `account_id`.
pub fn auth_header_for(account_id: &AccountId) -> String {
    format!("Bearer {}", token_for(account_id))
}

/// Create an account through the API.
pub async fn create_account_for(server: &TestServer, account_id: &AccountId) {
    server
        .post("/v1/accounts")
        .add_header("authorization", auth_header_for(account_id))
        .json(&json!({}))
        .await
        .assert_status(axum::http::StatusCode::CREATED);
}
