//! Background reconciliation of in-flight jobs.
//!
//! Jobs accepted asynchronously are settled by a provider callback or, when
//! that never arrives, by this poller. Jobs older than the maximum age fail
//! with a refund whatever the provider says.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, info, warn};

use creditline_core::Result;
use creditline_store::Store;

use super::{JobEngine, TaskStatus};

/// Jobs examined per tick.
const POLL_BATCH: usize = 200;

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Active jobs examined.
    pub checked: usize,
    /// Jobs completed from a provider result.
    pub completed: usize,
    /// Jobs failed from a provider error.
    pub failed: usize,
    /// Jobs failed for exceeding the maximum age.
    pub expired: usize,
}

/// Periodic job reconciler.
pub struct JobPoller {
    engine: JobEngine,
    store: Arc<dyn Store>,
    interval: Duration,
    max_age: Duration,
}

impl JobPoller {
    /// Create a poller.
    #[must_use]
    pub fn new(engine: JobEngine, store: Arc<dyn Store>, interval: Duration, max_age: Duration) -> Self {
        Self {
            engine,
            store,
            interval,
            max_age,
        }
    }

    /// Run forever, one pass per interval.
    pub async fn run(self) {
        info!(
            interval = ?self.interval,
            max_age = ?self.max_age,
            "Starting job poller"
        );

        let mut ticker = interval(self.interval);
        loop {
            ticker.tick().await;
            match self.poll_once().await {
                Ok(summary) if summary.checked > 0 => info!(
                    checked = summary.checked,
                    completed = summary.completed,
                    failed = summary.failed,
                    expired = summary.expired,
                    "Job poll finished"
                ),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Job poll failed"),
            }
        }
    }

    /// Examine every active job once.
    ///
    /// # Errors
    ///
    /// Returns an error if listing active jobs fails. Errors on single jobs
    /// are logged and skipped.
    pub async fn poll_once(&self) -> Result<PollSummary> {
        let jobs = self.store.list_active_jobs(POLL_BATCH).await?;
        let max_age = chrono::Duration::from_std(self.max_age)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let now = chrono::Utc::now();
        let mut summary = PollSummary::default();

        for job in jobs {
            summary.checked += 1;

            if now - job.created_at > max_age {
                let error = format!("job expired after {}s", self.max_age.as_secs());
                match self.engine.settle_failure(&job.id, &error).await {
                    Ok(update) if update.transition.is_apply() => summary.expired += 1,
                    Ok(_) => {}
                    Err(e) => warn!(job_id = %job.id, error = %e, "Failed to expire job"),
                }
                continue;
            }

            let (Some(provider), Some(task_id)) = (self.engine.provider(), job.external_task_id.as_deref())
            else {
                continue;
            };

            let status = match tokio::time::timeout(self.engine.timeout(), provider.poll(task_id)).await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    warn!(job_id = %job.id, task_id, error = %e, "Provider poll failed");
                    continue;
                }
                Err(_) => {
                    warn!(job_id = %job.id, task_id, "Provider poll timed out");
                    continue;
                }
            };

            let (update, completed) = match status {
                TaskStatus::Pending => {
                    debug!(job_id = %job.id, task_id, "Job still running");
                    continue;
                }
                TaskStatus::Completed { result_url } => {
                    (self.engine.settle_success(&job.id, &result_url).await, true)
                }
                TaskStatus::Failed { error } => {
                    (self.engine.settle_failure(&job.id, &error).await, false)
                }
            };

            match update {
                Ok(update) if update.transition.is_apply() => {
                    if completed {
                        summary.completed += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to settle polled job"),
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credits::CreditGuard;
    use crate::jobs::{GenerationProvider, ProviderError, Submission};
    use async_trait::async_trait;
    use creditline_core::{
        Account, AccountId, GenerationJob, JobPayload, JobStatus, PricingConfig, Upscale,
    };
    use creditline_store::MemoryStore;

    struct Finished;

    #[async_trait]
    impl GenerationProvider for Finished {
        async fn submit(&self, _job: &GenerationJob) -> std::result::Result<Submission, ProviderError> {
            Ok(Submission::Accepted {
                task_id: "unused".into(),
            })
        }

        async fn poll(&self, task_id: &str) -> std::result::Result<TaskStatus, ProviderError> {
            Ok(if task_id == "ok" {
                TaskStatus::Completed {
                    result_url: "https://cdn.example.com/r.png".into(),
                }
            } else {
                TaskStatus::Failed {
                    error: "rejected".into(),
                }
            })
        }
    }

    async fn setup() -> (JobPoller, Arc<MemoryStore>, AccountId) {
        let store = Arc::new(MemoryStore::new());
        let id = AccountId::generate();
        store.create_account(&Account::new(id, None)).await.unwrap();
        store.add(&id, 100, "seed").await.unwrap();
        let engine = JobEngine::new(
            store.clone(),
            CreditGuard::new(store.clone()),
            Some(Arc::new(Finished)),
            Arc::new(PricingConfig::default()),
            Duration::from_secs(1),
        );
        let poller = JobPoller::new(
            engine,
            store.clone(),
            Duration::from_secs(30),
            Duration::from_secs(600),
        );
        (poller, store, id)
    }

    async fn job_with_task(
        store: &MemoryStore,
        account: AccountId,
        task: Option<&str>,
        age: chrono::Duration,
    ) -> GenerationJob {
        let mut job = GenerationJob::new(
            account,
            JobPayload::Upscale(Upscale {
                image_url: "https://cdn.example.com/a.png".into(),
                factor: 2,
            }),
            10,
            None,
        );
        job.created_at -= age;
        store
            .create_jobs(std::slice::from_ref(&job), &job.hold_reason())
            .await
            .unwrap()
            .unwrap();
        if let Some(task) = task {
            store.attach_task_id(&job.id, task).await.unwrap();
        }
        job
    }

    #[tokio::test]
    async fn settles_polled_and_expired_jobs() {
        let (poller, store, id) = setup().await;
        let done = job_with_task(&store, id, Some("ok"), chrono::Duration::zero()).await;
        let bad = job_with_task(&store, id, Some("bad"), chrono::Duration::zero()).await;
        let stuck = job_with_task(&store, id, None, chrono::Duration::hours(1)).await;
        let fresh = job_with_task(&store, id, None, chrono::Duration::zero()).await;

        let summary = poller.poll_once().await.unwrap();
        assert_eq!(
            summary,
            PollSummary {
                checked: 4,
                completed: 1,
                failed: 1,
                expired: 1,
            }
        );

        let status = |job: GenerationJob| {
            let store = store.clone();
            async move { store.get_job(&job.id).await.unwrap().unwrap().status }
        };
        assert_eq!(status(done).await, JobStatus::Completed);
        assert_eq!(status(bad).await, JobStatus::Failed);
        assert_eq!(status(stuck).await, JobStatus::Failed);
        assert_eq!(status(fresh).await, JobStatus::Processing);

        // 100 - 4 * 10 held, two refunded.
        assert_eq!(store.get_account(&id).await.unwrap().unwrap().balance, 80);
    }
}
