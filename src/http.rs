//! # HTTP
//!
//! Transport errors and the reqwest backed implementations of [MonitoringApi] and [IngestApi]
//!
//! *the reqwest transports require the `http` feature flag*

use super::Error;
use async_trait::async_trait;
use bytes::Bytes;

#[cfg(feature = "http")]
use super::{delivery::IngestApi, fetcher::MonitoringApi};

/// Default base url of the Cloud Monitoring API
pub const MONITORING_API_URL: &str = "https://monitoring.googleapis.com/v3";

/// Path of the metric ingest endpoint below the tenant url
pub const INGEST_PATH: &str = "/api/v2/metrics/ingest";

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("could not acquire an access token: {0}")]
    Token(String),
    /// Transport failure of a non reqwest transport
    #[error("connection failed: {0}")]
    Connect(String),
    #[cfg(feature = "http")]
    #[error("could not send request")]
    Reqwest(#[from] reqwest::Error),
}

/// Status and body of a response, whatever the status was
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body for log messages, lossy for non UTF-8 payloads
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Supplies the OAuth access token for the Cloud Monitoring API
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, Error>;
}

/// A fixed token, for short lived processes and tests
#[async_trait]
impl TokenProvider for String {
    async fn token(&self) -> Result<String, Error> {
        Ok(self.clone())
    }
}

/// Cloud Monitoring API over a shared [reqwest::Client]
#[cfg(feature = "http")]
pub struct ReqwestMonitoringApi {
    client: reqwest::Client,
    base_url: String,
    tokens: std::sync::Arc<dyn TokenProvider>,
}

#[cfg(feature = "http")]
impl ReqwestMonitoringApi {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        tokens: std::sync::Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl MonitoringApi for ReqwestMonitoringApi {
    async fn list_time_series(&self, project_id: &str, query: &[(String, String)]) -> Result<ApiResponse, HttpError> {
        let token = self.tokens.token().await.map_err(|e| HttpError::Token(e.to_string()))?;
        let response = self
            .client
            .get(format!("{}/projects/{project_id}/timeSeries", self.base_url))
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;

        let status = response.status().as_u16();
        Ok(ApiResponse::new(status, response.bytes().await?))
    }
}

/// Metric ingest API over a shared [reqwest::Client]
#[cfg(feature = "http")]
pub struct ReqwestIngestApi {
    client: reqwest::Client,
    url: String,
}

#[cfg(feature = "http")]
impl ReqwestIngestApi {
    /// `tenant_url` is the environment root, the ingest path is appended unless already present
    pub fn new(client: reqwest::Client, tenant_url: &str) -> Self {
        Self {
            client,
            url: ingest_url(tenant_url),
        }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl IngestApi for ReqwestIngestApi {
    async fn post_lines(&self, token: &str, body: String) -> Result<ApiResponse, HttpError> {
        use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};

        let response = self
            .client
            .post(&self.url)
            .header(AUTHORIZATION, format!("Api-Token {token}"))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        Ok(ApiResponse::new(status, response.bytes().await?))
    }
}

/// Full ingest endpoint for a tenant url
pub fn ingest_url(tenant_url: &str) -> String {
    let base = tenant_url.trim_end_matches('/');
    if base.ends_with(INGEST_PATH) {
        base.to_string()
    } else {
        format!("{base}{INGEST_PATH}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_ingest_url() {
        assert_eq!(ingest_url("https://abc.example.com/"), "https://abc.example.com/api/v2/metrics/ingest");
        assert_eq!(
            ingest_url("https://abc.example.com/api/v2/metrics/ingest"),
            "https://abc.example.com/api/v2/metrics/ingest"
        );
    }

    #[test]
    fn response_helpers() {
        let response = ApiResponse::new(202, "accepted");
        assert!(response.is_success());
        assert_eq!(response.body_text(), "accepted");
        assert!(!ApiResponse::new(404, Bytes::new()).is_success());
    }

    #[tokio::test]
    async fn static_token() {
        let tokens = String::from("ya29.token");
        assert_eq!(tokens.token().await.unwrap(), "ya29.token");
    }
}
