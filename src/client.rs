//! Producer Client
//!
//! HTTP client for the REST side of the system: tells a running server that
//! a business's appointments changed, and reads its health counters.

use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use thiserror::Error;

use crate::api::dto::{HealthResponse, NotifyRequest};

/// Client for a queuecast server's HTTP endpoints
#[derive(Debug, Clone)]
pub struct NotifyClient {
    client: Client,
    base_url: String,
}

impl NotifyClient {
    /// Create a client for `base_url` (e.g. "http://localhost:8080")
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Report an appointment change; subscribers of the business's statistics
    /// channel receive a fresh snapshot.
    pub async fn notify_cita(&self, negocio_id: &str, action: &str) -> Result<String, ClientError> {
        let url = format!("{}/notify/cita", self.base_url);
        let body = NotifyRequest {
            negocio_id: negocio_id.to_string(),
            action: action.to_string(),
        };

        let response = self.client.post(&url).json(&body).send().await?;
        let response = check_status(response).await?;
        Ok(response.text().await?)
    }

    /// Fetch hub counters from `/health/status`
    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let url = format!("{}/health/status", self.base_url);

        let response = self.client.get(&url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status { status, body })
}

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Server returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

impl ClientError {
    /// Status code for server-side rejections
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::Request(e) => e.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash() {
        let client = NotifyClient::new("http://localhost:8080/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let client =
            NotifyClient::with_timeout("http://127.0.0.1:1", Duration::from_millis(500)).unwrap();
        let err = client.notify_cita("42", "created").await.unwrap_err();
        assert!(matches!(err, ClientError::Request(_)));
        assert!(err.status().is_none());
    }
}
