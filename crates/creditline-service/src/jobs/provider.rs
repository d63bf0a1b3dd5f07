//! Generation provider contract and its HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use creditline_core::{Billable, GenerationJob};

/// Error type for provider calls.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider answered with a non-success status.
    #[error("provider returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or message.
        message: String,
    },

    /// Provider did not answer within the budget.
    #[error("provider did not answer within {0:?}")]
    Timeout(Duration),

    /// Provider answered with something unusable.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

/// Immediate answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Result produced synchronously.
    Completed {
        /// Result reference.
        result_url: String,
    },
    /// Work accepted; poll `task_id` or wait for a callback.
    Accepted {
        /// Provider task id.
        task_id: String,
    },
    /// Provider refused the work.
    Failed {
        /// Provider error text.
        error: String,
    },
}

/// State of an asynchronous provider task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Still running.
    Pending,
    /// Finished with a result.
    Completed {
        /// Result reference.
        result_url: String,
    },
    /// Finished without a result.
    Failed {
        /// Provider error text.
        error: String,
    },
}

/// An external service that performs generation work.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Submit a job.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot be reached or answers badly.
    async fn submit(&self, job: &GenerationJob) -> Result<Submission, ProviderError>;

    /// Check on an accepted task.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot be reached or answers badly.
    async fn poll(&self, task_id: &str) -> Result<TaskStatus, ProviderError>;
}

/// Task document exchanged with the provider, in responses and callbacks.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTask {
    /// Provider task id.
    #[serde(default)]
    pub task_id: Option<String>,
    /// `pending`, `processing`, `completed` or `failed`.
    pub status: String,
    /// Result reference when completed.
    #[serde(default)]
    pub result_url: Option<String>,
    /// Error text when failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl ProviderTask {
    /// Interpret the task's state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidResponse` for an unknown status or a completed task
    /// without a result.
    pub fn task_status(&self) -> Result<TaskStatus, ProviderError> {
        match self.status.as_str() {
            "pending" | "queued" | "processing" | "running" => Ok(TaskStatus::Pending),
            "completed" | "succeeded" => match &self.result_url {
                Some(url) => Ok(TaskStatus::Completed {
                    result_url: url.clone(),
                }),
                None => Err(ProviderError::InvalidResponse(
                    "completed task without result_url".into(),
                )),
            },
            "failed" | "error" => Ok(TaskStatus::Failed {
                error: self
                    .error
                    .clone()
                    .unwrap_or_else(|| "provider reported failure".to_string()),
            }),
            other => Err(ProviderError::InvalidResponse(format!(
                "unknown task status: {other}"
            ))),
        }
    }

    fn into_submission(self) -> Result<Submission, ProviderError> {
        match self.task_status()? {
            TaskStatus::Completed { result_url } => Ok(Submission::Completed { result_url }),
            TaskStatus::Failed { error } => Ok(Submission::Failed { error }),
            TaskStatus::Pending => self
                .task_id
                .map(|task_id| Submission::Accepted { task_id })
                .ok_or_else(|| ProviderError::InvalidResponse("pending task without task_id".into())),
        }
    }
}

/// Provider reached over HTTP: `POST {base}/v1/tasks`, `GET {base}/v1/tasks/{id}`.
#[derive(Debug, Clone)]
pub struct HttpGenerationProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpGenerationProvider {
    /// Create a provider client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn read_task(response: reqwest::Response) -> Result<ProviderTask, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl GenerationProvider for HttpGenerationProvider {
    async fn submit(&self, job: &GenerationJob) -> Result<Submission, ProviderError> {
        let body = serde_json::json!({
            "job_id": job.id.to_string(),
            "kind": job.payload.kind(),
            "request": job.payload.provider_request(),
        });

        tracing::debug!(job_id = %job.id, kind = job.payload.kind(), "Submitting job to provider");

        let response = self
            .authorized(self.client.post(format!("{}/v1/tasks", self.base_url)))
            .json(&body)
            .send()
            .await?;

        Self::read_task(response).await?.into_submission()
    }

    async fn poll(&self, task_id: &str) -> Result<TaskStatus, ProviderError> {
        let response = self
            .authorized(
                self.client
                    .get(format!("{}/v1/tasks/{task_id}", self.base_url)),
            )
            .send()
            .await?;

        Self::read_task(response).await?.task_status()
    }
}
