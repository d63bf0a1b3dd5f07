//! Job settlement engine.
//!
//! Creating a job holds its credits and returns at once; a spawned task then
//! submits the job to the generation provider under a time budget. The job
//! settles exactly once:
//!
//! - provider result → `completed`, held credits are spent
//! - provider error, timeout or expiry → `failed`, held credits refunded
//!
//! Settlement is guarded by the job's own status in the store, so a late
//! callback after a timeout cannot refund twice.

pub mod poller;
pub mod provider;

pub use poller::{JobPoller, PollSummary};
pub use provider::{
    GenerationProvider, HttpGenerationProvider, ProviderError, ProviderTask, Submission,
    TaskStatus,
};

use std::sync::Arc;
use std::time::Duration;

use creditline_core::{
    split_batch_cost, AccountId, BatchId, Billable, BillingError, EnhancementMode, GenerationJob,
    JobId, JobPayload, PricingConfig, Result, SkinEnhancement, Transition,
};
use creditline_store::{JobUpdate, Store};

use crate::credits::CreditGuard;

/// Error text for jobs created while no provider is configured.
pub const NO_PROVIDER: &str = "generation provider not configured";

/// Creates, dispatches and settles generation jobs.
#[derive(Clone)]
pub struct JobEngine {
    store: Arc<dyn Store>,
    credits: CreditGuard,
    provider: Option<Arc<dyn GenerationProvider>>,
    pricing: Arc<PricingConfig>,
    timeout: Duration,
}

impl JobEngine {
    /// Create an engine.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        credits: CreditGuard,
        provider: Option<Arc<dyn GenerationProvider>>,
        pricing: Arc<PricingConfig>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            credits,
            provider,
            pricing,
            timeout,
        }
    }

    pub(crate) fn provider(&self) -> Option<&Arc<dyn GenerationProvider>> {
        self.provider.as_ref()
    }

    pub(crate) const fn timeout(&self) -> Duration {
        self.timeout
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Hold credits for `payload`, persist the job and start it.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` if the payload is malformed.
    /// - `InsufficientCredits` if the balance does not cover the price; no job
    ///   is created.
    /// - `AccountNotFound` for an unknown account.
    pub async fn create_job(&self, account_id: &AccountId, payload: JobPayload) -> Result<GenerationJob> {
        let cost = payload.credit_cost(&self.pricing)?;
        let job = GenerationJob::new(*account_id, payload, cost, None);

        if self
            .store
            .create_jobs(std::slice::from_ref(&job), &job.hold_reason())
            .await?
            .is_none()
        {
            return Err(self.credits.insufficient(account_id, cost).await);
        }

        tracing::info!(
            account_id = %account_id,
            job_id = %job.id,
            kind = job.payload.kind(),
            amount = cost,
            "Job created; credits held"
        );

        self.spawn_dispatch(job.clone());
        Ok(job)
    }

    /// Hold one batch charge for several skin enhancements and start them.
    ///
    /// The charge is split across the items (remainder on the first); a
    /// failed item refunds its own share.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` for a batch size out of range or a bad image URL.
    /// - `InsufficientCredits` if the balance does not cover the batch.
    /// - `AccountNotFound` for an unknown account.
    pub async fn create_batch(
        &self,
        account_id: &AccountId,
        image_urls: Vec<String>,
        mode: EnhancementMode,
        pro_mode: bool,
    ) -> Result<Vec<GenerationJob>> {
        let total = self.pricing.batch_price(image_urls.len(), pro_mode)?;
        let shares = split_batch_cost(total, image_urls.len());
        if shares.iter().any(|&s| s <= 0) {
            return Err(BillingError::Configuration(format!(
                "batch price {total} cannot be split across {} items",
                image_urls.len()
            )));
        }

        let batch_id = BatchId::generate();
        let jobs = image_urls
            .into_iter()
            .zip(shares)
            .map(|(image_url, share)| {
                let payload = JobPayload::SkinEnhancement(SkinEnhancement {
                    image_url,
                    mode,
                    pro_mode,
                });
                payload.credit_cost(&self.pricing)?;
                Ok(GenerationJob::new(*account_id, payload, share, Some(batch_id)))
            })
            .collect::<Result<Vec<_>>>()?;

        let reason = format!(
            "skin enhancement batch {batch_id} ({} images, {})",
            jobs.len(),
            mode.as_str()
        );
        if self.store.create_jobs(&jobs, &reason).await?.is_none() {
            return Err(self.credits.insufficient(account_id, total).await);
        }

        tracing::info!(
            account_id = %account_id,
            batch_id = %batch_id,
            items = jobs.len(),
            amount = total,
            "Batch created; credits held"
        );

        for job in &jobs {
            self.spawn_dispatch(job.clone());
        }
        Ok(jobs)
    }

    fn spawn_dispatch(&self, job: GenerationJob) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.dispatch(&job).await {
                tracing::error!(job_id = %job.id, error = %e, "Job dispatch failed");
            }
        });
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Submit a job and act on the provider's immediate answer.
    ///
    /// Provider errors and timeouts settle the job as failed; only storage
    /// errors are returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails while recording the outcome.
    pub async fn dispatch(&self, job: &GenerationJob) -> Result<GenerationJob> {
        let Some(provider) = &self.provider else {
            return Ok(self.settle_failure(&job.id, NO_PROVIDER).await?.job);
        };

        let submission = match tokio::time::timeout(self.timeout, provider.submit(job)).await {
            Ok(Ok(submission)) => submission,
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job.id, error = %e, "Provider submission failed");
                return Ok(self.settle_failure(&job.id, &e.to_string()).await?.job);
            }
            Err(_) => {
                let error = ProviderError::Timeout(self.timeout).to_string();
                tracing::warn!(job_id = %job.id, "Provider submission timed out");
                return Ok(self.settle_failure(&job.id, &error).await?.job);
            }
        };

        match submission {
            Submission::Completed { result_url } => {
                Ok(self.settle_success(&job.id, &result_url).await?.job)
            }
            Submission::Failed { error } => Ok(self.settle_failure(&job.id, &error).await?.job),
            Submission::Accepted { task_id } => {
                let job = self.store.attach_task_id(&job.id, &task_id).await?;
                tracing::info!(job_id = %job.id, task_id = %task_id, "Job accepted by provider");
                Ok(job)
            }
        }
    }

    // =========================================================================
    // Settlement
    // =========================================================================

    /// Record a provider result. No credits move.
    ///
    /// # Errors
    ///
    /// Returns `JobNotFound` for an unknown job.
    pub async fn settle_success(&self, job_id: &JobId, result_url: &str) -> Result<JobUpdate> {
        let update = self.store.complete_job(job_id, result_url).await?;
        match update.transition {
            Transition::Apply => {
                tracing::info!(job_id = %job_id, account_id = %update.job.account_id, "Job completed");
            }
            Transition::AlreadyApplied => {
                tracing::info!(job_id = %job_id, "Duplicate completion ignored");
            }
            Transition::Rejected => tracing::warn!(
                job_id = %job_id,
                status = %update.job.status,
                "Late result for settled job ignored"
            ),
        }
        Ok(update)
    }

    /// Mark a job failed and refund its held credits, once.
    ///
    /// # Errors
    ///
    /// Returns `JobNotFound` for an unknown job.
    pub async fn settle_failure(&self, job_id: &JobId, error: &str) -> Result<JobUpdate> {
        let update = self.store.fail_job(job_id, error).await?;
        match update.transition {
            Transition::Apply => tracing::info!(
                job_id = %job_id,
                account_id = %update.job.account_id,
                amount = update.job.credit_cost,
                error,
                "Job failed; credits refunded"
            ),
            Transition::AlreadyApplied => {
                tracing::info!(job_id = %job_id, "Duplicate failure ignored");
            }
            Transition::Rejected => tracing::warn!(
                job_id = %job_id,
                status = %update.job.status,
                "Late failure for settled job ignored"
            ),
        }
        Ok(update)
    }

    /// Cancel an in-flight job. No credits move.
    ///
    /// # Errors
    ///
    /// - `JobNotFound` for an unknown job.
    /// - `InvalidTransition` if the job already completed or failed.
    pub async fn cancel(&self, job_id: &JobId, reason: &str) -> Result<GenerationJob> {
        let update = self.store.cancel_job(job_id, reason).await?;
        if update.transition == Transition::Rejected {
            return Err(BillingError::InvalidTransition {
                entity: "job",
                id: job_id.to_string(),
                from: update.job.status.to_string(),
                to: "cancelled".to_string(),
            });
        }
        tracing::info!(job_id = %job_id, reason, "Job cancelled");
        Ok(update.job)
    }

    /// Apply an asynchronous provider report for `task_id`.
    ///
    /// Returns `None` while the task is still pending.
    ///
    /// # Errors
    ///
    /// Returns `JobNotFound` if no job carries the task id.
    pub async fn handle_task_update(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<Option<JobUpdate>> {
        let job = self
            .store
            .find_job_by_task_id(task_id)
            .await?
            .ok_or_else(|| BillingError::JobNotFound {
                job_id: format!("task {task_id}"),
            })?;

        match status {
            TaskStatus::Pending => Ok(None),
            TaskStatus::Completed { result_url } => {
                Ok(Some(self.settle_success(&job.id, &result_url).await?))
            }
            TaskStatus::Failed { error } => Ok(Some(self.settle_failure(&job.id, &error).await?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use creditline_core::{Account, EntryKind, JobStatus, Upscale};
    use creditline_store::MemoryStore;

    struct Scripted(std::result::Result<Submission, ()>, Duration);

    #[async_trait]
    impl GenerationProvider for Scripted {
        async fn submit(&self, _job: &GenerationJob) -> std::result::Result<Submission, ProviderError> {
            tokio::time::sleep(self.1).await;
            self.0.clone().map_err(|()| ProviderError::Api {
                status: 500,
                message: "boom".into(),
            })
        }

        async fn poll(&self, _task_id: &str) -> std::result::Result<TaskStatus, ProviderError> {
            Ok(TaskStatus::Pending)
        }
    }

    async fn engine(
        provider: Option<Arc<dyn GenerationProvider>>,
        balance: i64,
    ) -> (JobEngine, Arc<MemoryStore>, AccountId) {
        let store = Arc::new(MemoryStore::new());
        let id = AccountId::generate();
        store.create_account(&Account::new(id, None)).await.unwrap();
        if balance > 0 {
            store.add(&id, balance, "seed").await.unwrap();
        }
        let engine = JobEngine::new(
            store.clone(),
            CreditGuard::new(store.clone()),
            provider,
            Arc::new(PricingConfig::default()),
            Duration::from_millis(50),
        );
        (engine, store, id)
    }

    fn upscale() -> GenerationJob {
        GenerationJob::new(
            AccountId::generate(),
            JobPayload::Upscale(Upscale {
                image_url: "https://cdn.example.com/a.png".into(),
                factor: 4,
            }),
            20,
            None,
        )
    }

    async fn held_job(store: &MemoryStore, account: AccountId) -> GenerationJob {
        let mut job = upscale();
        job.account_id = account;
        store
            .create_jobs(std::slice::from_ref(&job), &job.hold_reason())
            .await
            .unwrap()
            .unwrap();
        job
    }

    #[tokio::test]
    async fn provider_error_refunds_hold() {
        let provider: Arc<dyn GenerationProvider> = Arc::new(Scripted(Err(()), Duration::ZERO));
        let (engine, store, id) = engine(Some(provider), 100).await;
        let job = held_job(&store, id).await;

        let settled = engine.dispatch(&job).await.unwrap();
        assert_eq!(settled.status, JobStatus::Failed);

        let balance = store.get_account(&id).await.unwrap().unwrap().balance;
        assert_eq!(balance, 100);
        let kinds: Vec<_> = store
            .ledger_for_account(&id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EntryKind::Grant, EntryKind::Deduct, EntryKind::Refund]);
    }

    #[tokio::test]
    async fn timeout_is_a_failure() {
        let provider: Arc<dyn GenerationProvider> = Arc::new(Scripted(
            Ok(Submission::Completed {
                result_url: "https://cdn.example.com/out.png".into(),
            }),
            Duration::from_secs(5),
        ));
        let (engine, store, id) = engine(Some(provider), 100).await;
        let job = held_job(&store, id).await;

        let settled = engine.dispatch(&job).await.unwrap();
        assert_eq!(settled.status, JobStatus::Failed);
        assert!(settled.error_message.unwrap().contains("did not answer"));
        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, 100);
    }

    #[tokio::test]
    async fn late_failure_after_completion_does_not_refund() {
        let (engine, store, id) = engine(None, 100).await;
        let job = held_job(&store, id).await;

        engine.settle_success(&job.id, "https://cdn.example.com/x.png").await.unwrap();
        let late = engine.settle_failure(&job.id, "late error").await.unwrap();

        assert_eq!(late.transition, Transition::Rejected);
        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, 80);
    }

    #[tokio::test]
    async fn double_failure_refunds_once() {
        let (engine, store, id) = engine(None, 100).await;
        let job = held_job(&store, id).await;

        engine.settle_failure(&job.id, "first").await.unwrap();
        let second = engine.settle_failure(&job.id, "second").await.unwrap();

        assert_eq!(second.transition, Transition::AlreadyApplied);
        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, 100);
    }

    #[tokio::test]
    async fn insufficient_credits_create_nothing() {
        let (engine, store, id) = engine(None, 10).await;
        let err = engine
            .create_job(
                &id,
                JobPayload::Upscale(Upscale {
                    image_url: "https://cdn.example.com/a.png".into(),
                    factor: 4,
                }),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BillingError::InsufficientCredits {
                balance: 10,
                required: 20
            }
        ));
        assert!(store.list_jobs(&id, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_of_completed_job_is_rejected() {
        let (engine, store, id) = engine(None, 100).await;
        let job = held_job(&store, id).await;
        engine.settle_success(&job.id, "https://cdn.example.com/x.png").await.unwrap();

        let err = engine.cancel(&job.id, "admin").await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn accepted_task_settles_through_update() {
        let provider: Arc<dyn GenerationProvider> = Arc::new(Scripted(
            Ok(Submission::Accepted {
                task_id: "t-9".into(),
            }),
            Duration::ZERO,
        ));
        let (engine, store, id) = engine(Some(provider), 100).await;
        let job = held_job(&store, id).await;

        let accepted = engine.dispatch(&job).await.unwrap();
        assert_eq!(accepted.external_task_id.as_deref(), Some("t-9"));
        assert_eq!(accepted.status, JobStatus::Processing);

        let update = engine
            .handle_task_update(
                "t-9",
                TaskStatus::Completed {
                    result_url: "https://cdn.example.com/y.png".into(),
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.job.status, JobStatus::Completed);
        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, 80);
    }
}
