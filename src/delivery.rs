//! # Delivery
//!
//! Batched POSTs of MINT lines to the ingest endpoint and classification of its responses

use super::collector::{SelfMonitoring, API_INGEST};
use super::http::{ApiResponse, HttpError};
use super::mint::IngestLine;
use super::pacer::DeliveryPacer;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

/// Transport for the metric ingest endpoint
#[async_trait]
pub trait IngestApi: Send + Sync {
    /// POST a newline joined body with the given API token
    async fn post_lines(&self, token: &str, body: String) -> Result<ApiResponse, HttpError>;
}

/// Reachability of the ingest endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectivityState {
    Ok = 0,
    ExpiredToken = 1,
    WrongToken = 2,
    WrongUrl = 3,
    TooManyRequests = 4,
    Other = 5,
}

impl ConnectivityState {
    /// State a response status maps to, `None` for statuses handled as a regular response
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            200 => Some(ConnectivityState::Ok),
            401 => Some(ConnectivityState::ExpiredToken),
            403 => Some(ConnectivityState::WrongToken),
            404 | 405 => Some(ConnectivityState::WrongUrl),
            429 => Some(ConnectivityState::TooManyRequests),
            _ => None,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectivityState::Ok,
            1 => ConnectivityState::ExpiredToken,
            2 => ConnectivityState::WrongToken,
            3 => ConnectivityState::WrongUrl,
            4 => ConnectivityState::TooManyRequests,
            _ => ConnectivityState::Other,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("ingest endpoint unavailable: {0:?}")]
    Connectivity(ConnectivityState),
    #[error(transparent)]
    Http(#[from] HttpError),
}

/// Outcome of one push
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushSummary {
    pub batches_sent: u64,
    pub lines_ok: u64,
    pub lines_invalid: u64,
    pub lines_dropped: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct IngestResponse {
    lines_ok: u64,
    lines_invalid: u64,
    warnings: Option<IngestWarnings>,
    error: Option<IngestErrors>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct IngestWarnings {
    warning_lines: Vec<LineMessage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct IngestErrors {
    invalid_lines: Vec<LineMessage>,
}

/// A message about one line of a batch, `line` is 1-based
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LineMessage {
    line: usize,
    #[serde(alias = "warning")]
    error: String,
}

pub struct DeliveryClient {
    api: Arc<dyn IngestApi>,
    token: RwLock<String>,
    batch_size: usize,
    connectivity: AtomicU8,
    monitoring: Arc<SelfMonitoring>,
    pacer: Option<Arc<DeliveryPacer>>,
}

impl DeliveryClient {
    pub fn new(api: Arc<dyn IngestApi>, token: String, batch_size: usize, monitoring: Arc<SelfMonitoring>) -> Self {
        Self {
            api,
            token: RwLock::new(token),
            batch_size: batch_size.max(1),
            connectivity: AtomicU8::new(ConnectivityState::Ok as u8),
            monitoring,
            pacer: None,
        }
    }

    /// Pace every batch through `pacer`
    pub fn with_pacer(self, pacer: Arc<DeliveryPacer>) -> Self {
        Self {
            pacer: Some(pacer),
            ..self
        }
    }

    pub fn connectivity(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.connectivity.load(Ordering::Acquire))
    }

    /// Install a new API token, re-enabling delivery after a token failure
    pub fn update_token(&self, token: String) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
        self.set_connectivity(ConnectivityState::Ok);
        info!("Ingest API token updated");
    }

    fn set_connectivity(&self, state: ConnectivityState) {
        self.connectivity.store(state as u8, Ordering::Release);
        self.monitoring.set_connectivity(state as u8);
    }

    fn token(&self) -> String {
        self.token.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Send `lines` in batches of at most the configured size, each batch waiting for its pacer slot
    ///
    /// Skipped without pacing while the endpoint is known to be unreachable. A token or url
    /// failure aborts the remaining batches, throttled batches are dropped and counted.
    pub async fn push(&self, lines: &[IngestLine]) -> Result<PushSummary, DeliveryError> {
        let mut summary = PushSummary::default();
        if lines.is_empty() {
            return Ok(summary);
        }

        let state = self.connectivity();
        if state != ConnectivityState::Ok {
            warn!("Skipping push of {} lines, ingest connectivity is {state:?}", lines.len());
            return Ok(summary);
        }

        for batch in lines.chunks(self.batch_size) {
            // the flush semaphore is never closed
            let _permit = match &self.pacer {
                Some(pacer) => pacer.ready(batch.len()).await.ok(),
                None => None,
            };
            let body = batch.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n");

            let response = match self.api.post_lines(&self.token(), body).await {
                Ok(response) => response,
                Err(e) => {
                    error!("Failed to send {} lines: {e}", batch.len());
                    self.set_connectivity(ConnectivityState::Other);
                    return Err(e.into());
                }
            };
            summary.batches_sent += 1;
            self.monitoring.record_request(API_INGEST, response.status);

            match ConnectivityState::from_status(response.status) {
                Some(ConnectivityState::TooManyRequests) => {
                    warn!("Ingest endpoint throttled, dropping {} lines", batch.len());
                    summary.lines_dropped += batch.len() as u64;
                    self.monitoring.add_lines_dropped(batch.len() as u64);
                    continue;
                }
                Some(state @ ConnectivityState::Ok) => self.set_connectivity(state),
                Some(state) => {
                    error!(
                        "Ingest endpoint rejected the request with status {}: {}",
                        response.status,
                        response.body_text()
                    );
                    self.set_connectivity(state);
                    return Err(DeliveryError::Connectivity(state));
                }
                None if matches!(response.status, 413 | 500) => {
                    warn!("Ingest endpoint responded with status {}", response.status);
                }
                None => {}
            }

            let (ok, invalid) = self.record_response(&response, batch);
            summary.lines_ok += ok;
            summary.lines_invalid += invalid;
        }

        debug!("Pushed {} lines in {} batches", lines.len(), summary.batches_sent);
        Ok(summary)
    }

    /// Count and log the per line outcome of one batch
    fn record_response(&self, response: &ApiResponse, batch: &[IngestLine]) -> (u64, u64) {
        let parsed: IngestResponse = match serde_json::from_slice(&response.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    "Unable to parse ingest response with status {}: {e}: {}",
                    response.status,
                    response.body_text()
                );
                return (0, 0);
            }
        };

        let warnings = parsed.warnings.map(|w| w.warning_lines).unwrap_or_default();
        for warning in warnings.iter().filter(|w| !is_benign(&w.error)) {
            warn!("Ingest warning for line {}: {}", warning.line, warning.error);
        }

        let invalid_lines = parsed.error.map(|e| e.invalid_lines).unwrap_or_default();
        for invalid in &invalid_lines {
            match invalid.line.checked_sub(1).and_then(|index| batch.get(index)) {
                Some(line) => warn!("Invalid line: {} ({line})", invalid.error),
                None => warn!("Invalid line {}: {}", invalid.line, invalid.error),
            }
        }

        self.monitoring.add_lines_ok(parsed.lines_ok);
        self.monitoring.add_lines_invalid(parsed.lines_invalid);
        (parsed.lines_ok, parsed.lines_invalid)
    }
}

/// The endpoint warns on every count line about deprecated monotonic counters
fn is_benign(warning: &str) -> bool {
    let warning = warning.to_lowercase();
    warning.contains("monotonic") && warning.contains("deprecated")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mint::{MintType, MintValue};
    use crate::test::FakeIngestApi;
    use std::time::Duration;
    use tokio::time::Instant;

    fn lines(count: usize) -> Vec<IngestLine> {
        (0..count)
            .map(|i| IngestLine {
                entity_id: String::new(),
                metric_name: "cloud.gcp.pubsub_googleapis_com.topic.send_request_count".into(),
                metric_type: MintType::Count,
                value: MintValue::Scalar(i as f64),
                timestamp: 1687427760000,
                dimensions: Vec::new(),
            })
            .collect()
    }

    fn client(api: &Arc<FakeIngestApi>, batch_size: usize) -> (DeliveryClient, Arc<SelfMonitoring>) {
        let monitoring = Arc::new(SelfMonitoring::new());
        let client = DeliveryClient::new(api.clone(), "dt0c01.token".into(), batch_size, monitoring.clone());
        (client, monitoring)
    }

    #[test]
    fn status_classification() {
        assert_eq!(ConnectivityState::from_status(200), Some(ConnectivityState::Ok));
        assert_eq!(ConnectivityState::from_status(401), Some(ConnectivityState::ExpiredToken));
        assert_eq!(ConnectivityState::from_status(403), Some(ConnectivityState::WrongToken));
        assert_eq!(ConnectivityState::from_status(404), Some(ConnectivityState::WrongUrl));
        assert_eq!(ConnectivityState::from_status(405), Some(ConnectivityState::WrongUrl));
        assert_eq!(ConnectivityState::from_status(429), Some(ConnectivityState::TooManyRequests));
        assert_eq!(ConnectivityState::from_status(202), None);
        assert_eq!(ConnectivityState::from_status(500), None);
    }

    #[tokio::test]
    async fn splits_into_batches() {
        let api = Arc::new(FakeIngestApi::default());
        let (client, monitoring) = client(&api, 1000);
        for count in [1000, 1000, 500] {
            api.respond(200, format!(r#"{{"linesOk": {count}, "linesInvalid": 0}}"#));
        }

        let summary = client.push(&lines(2500)).await.unwrap();
        assert_eq!(api.batch_sizes(), vec![1000, 1000, 500]);
        assert_eq!(
            summary,
            PushSummary {
                batches_sent: 3,
                lines_ok: 2500,
                lines_invalid: 0,
                lines_dropped: 0
            }
        );

        let counters = monitoring.snapshot();
        assert_eq!(counters.lines_ok, 2500);
        assert_eq!(counters.requests[&(API_INGEST.to_string(), 200)], 3);

        let requests = api.requests();
        let (token, body) = &requests[2];
        assert_eq!(token, "dt0c01.token");
        assert!(body.starts_with("cloud.gcp.pubsub_googleapis_com.topic.send_request_count count,delta=2000 "));
        assert!(!body.ends_with('\n'));
    }

    #[tokio::test]
    async fn throttled_batches_are_dropped() {
        let api = Arc::new(FakeIngestApi::default());
        let (client, monitoring) = client(&api, 2);
        api.respond(429, "");
        api.respond(200, r#"{"linesOk": 1, "linesInvalid": 0}"#);

        let summary = client.push(&lines(3)).await.unwrap();
        assert_eq!(api.batch_sizes(), vec![2, 1]);
        assert_eq!(summary.lines_dropped, 2);
        assert_eq!(summary.lines_ok, 1);
        assert_eq!(monitoring.snapshot().lines_dropped, 2);
        assert_eq!(client.connectivity(), ConnectivityState::Ok);
    }

    #[tokio::test]
    async fn expired_token_aborts_the_push() {
        let api = Arc::new(FakeIngestApi::default());
        let (client, _) = client(&api, 1);
        api.respond(401, "token expired");

        let error = client.push(&lines(3)).await.unwrap_err();
        assert!(matches!(error, DeliveryError::Connectivity(ConnectivityState::ExpiredToken)));
        assert_eq!(api.batch_sizes(), vec![1]);
        assert_eq!(client.connectivity(), ConnectivityState::ExpiredToken);
    }

    #[tokio::test]
    async fn push_resumes_after_token_update() {
        let api = Arc::new(FakeIngestApi::default());
        let (client, _) = client(&api, 10);
        api.respond(403, "");

        assert!(client.push(&lines(1)).await.is_err());
        assert_eq!(client.connectivity(), ConnectivityState::WrongToken);

        // skipped without a request while the token is known to be wrong
        assert_eq!(client.push(&lines(1)).await.unwrap(), PushSummary::default());
        assert_eq!(api.requests().len(), 1);

        client.update_token("dt0c01.new".into());
        api.respond(200, r#"{"linesOk": 1}"#);
        assert_eq!(client.push(&lines(1)).await.unwrap().lines_ok, 1);
        assert_eq!(api.requests()[1].0, "dt0c01.new");
    }

    #[tokio::test]
    async fn transport_failure_sets_other() {
        let api = Arc::new(FakeIngestApi::default());
        let (client, _) = client(&api, 10);
        api.fail("connection refused");

        assert!(matches!(client.push(&lines(1)).await, Err(DeliveryError::Http(_))));
        assert_eq!(client.connectivity(), ConnectivityState::Other);
    }

    #[tokio::test]
    async fn partial_failures_are_counted() {
        let api = Arc::new(FakeIngestApi::default());
        let (client, monitoring) = client(&api, 10);
        api.respond(
            400,
            r#"{"linesOk": 2, "linesInvalid": 1,
                "warnings": {"warningLines": [{"line": 1, "warning": "monotonic counters are deprecated"}]},
                "error": {"code": 400, "invalidLines": [{"line": 3, "error": "invalid dimension value"}]}}"#,
        );

        let summary = client.push(&lines(3)).await.unwrap();
        assert_eq!((summary.lines_ok, summary.lines_invalid), (2, 1));
        assert_eq!(monitoring.snapshot().lines_invalid, 1);
        assert_eq!(client.connectivity(), ConnectivityState::Ok);
    }

    #[tokio::test]
    async fn unparseable_body_is_ignored() {
        let api = Arc::new(FakeIngestApi::default());
        let (client, _) = client(&api, 10);
        api.respond(500, "<html>oops</html>");

        let summary = client.push(&lines(2)).await.unwrap();
        assert_eq!(summary.batches_sent, 1);
        assert_eq!(summary.lines_ok, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn every_batch_waits_for_its_slot() {
        let api = Arc::new(FakeIngestApi::default());
        let (client, _) = client(&api, 1000);
        let client = client.with_pacer(Arc::new(DeliveryPacer::new(Some(1000), 4)));
        let start = Instant::now();

        let summary = client.push(&lines(3000)).await.unwrap();
        assert_eq!(summary.lines_ok, 3000);
        assert_eq!(api.batch_sizes(), vec![1000, 1000, 1000]);
        assert_eq!(
            api.offsets(start),
            vec![Duration::ZERO, Duration::from_secs(60), Duration::from_secs(120)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_pushes_are_not_paced() {
        let api = Arc::new(FakeIngestApi::default());
        let (client, _) = client(&api, 1000);
        let client = client.with_pacer(Arc::new(DeliveryPacer::new(Some(1000), 4)));
        let start = Instant::now();
        api.respond(401, "");

        assert!(client.push(&lines(1000)).await.is_err());
        assert_eq!(client.push(&lines(3000)).await.unwrap(), PushSummary::default());
        assert_eq!(Instant::now(), start);

        client.update_token("dt0c01.new".into());
        client.push(&lines(1000)).await.unwrap();
        assert_eq!(api.offsets(start), vec![Duration::ZERO, Duration::from_secs(60)]);
    }

    #[test]
    fn benign_warning_filter() {
        assert!(is_benign("Monotonic counters are deprecated, use delta"));
        assert!(!is_benign("dimension value truncated"));
    }
}
