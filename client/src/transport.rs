//! Transport seam to the floeterm REST API.
//!
//! The coordinator talks to this trait; the production implementation is
//! `HttpTransport` (reqwest), which retries transient failures with
//! exponential backoff capped at five seconds. Client errors (4xx) are
//! final — retrying a 404 never helps.

use std::time::Duration;

use async_trait::async_trait;
use floeterm_core::events::SessionInfo;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server rejected request: {status} {message}")]
    Rejected { status: u16, message: String },
}

impl TransportError {
    /// Whether retrying could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Http(_) => true,
            TransportError::Rejected { status, .. } => *status >= 500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

#[async_trait]
pub trait SessionsTransport: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, TransportError>;
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<SessionInfo, TransportError>;
    async fn delete_session(&self, id: &str) -> Result<(), TransportError>;
}

/// Delay before retry `attempt` (1-based): doubles from 250 ms, capped at 5 s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let ms = 250u64.saturating_mul(1u64 << attempt.min(6)) / 2;
    Duration::from_millis(ms.min(5_000))
}

pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    max_attempts: u32,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            max_attempts: 5,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn checked(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(TransportError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn sleep_before_retry(&self, attempt: u32, error: &TransportError) {
        debug!(attempt, error = %error, "transport retry");
        tokio::time::sleep(backoff_delay(attempt)).await;
    }
}

#[async_trait]
impl SessionsTransport for HttpTransport {
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, TransportError> {
        let mut attempt = 0;
        loop {
            let result: Result<Vec<SessionInfo>, TransportError> = async {
                let response = self.client.get(self.url("/api/sessions")).send().await?;
                Ok(Self::checked(response).await?.json().await?)
            }
            .await;
            match result {
                Ok(sessions) => return Ok(sessions),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    attempt += 1;
                    self.sleep_before_retry(attempt, &e).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<SessionInfo, TransportError> {
        let mut attempt = 0;
        loop {
            let result: Result<SessionInfo, TransportError> = async {
                let response = self
                    .client
                    .post(self.url("/api/sessions"))
                    .json(&request)
                    .send()
                    .await?;
                Ok(Self::checked(response).await?.json().await?)
            }
            .await;
            match result {
                Ok(session) => return Ok(session),
                // Creation is not idempotent; only network-level failures
                // before a response are safe to retry.
                Err(TransportError::Http(e)) if e.is_connect() && attempt + 1 < self.max_attempts => {
                    attempt += 1;
                    self.sleep_before_retry(attempt, &TransportError::Http(e)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn delete_session(&self, id: &str) -> Result<(), TransportError> {
        let mut attempt = 0;
        loop {
            let result: Result<(), TransportError> = async {
                let response = self
                    .client
                    .delete(self.url(&format!("/api/sessions/{id}")))
                    .send()
                    .await?;
                Self::checked(response).await?;
                Ok(())
            }
            .await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    attempt += 1;
                    self.sleep_before_retry(attempt, &e).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
