//! # Fetcher
//!
//! Paginated retrieval of the aligned time series of one metric in one project

use super::aggregation;
use super::collector::{SelfMonitoring, API_MONITORING};
use super::http::{ApiResponse, HttpError};
use super::model::{Dimension, MetricDefinition, ServiceDefinition};
use super::timeseries::{TimeSeries, TimeSeriesPage};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use std::sync::Arc;
use tracing::debug;

/// Transport for `projects.timeSeries.list`
#[async_trait]
pub trait MonitoringApi: Send + Sync {
    /// Issue one request, `query` holds the already encoded parameters (repeated keys allowed)
    async fn list_time_series(&self, project_id: &str, query: &[(String, String)]) -> Result<ApiResponse, HttpError>;
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("monitoring API responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("monitoring API reported an error: {0}")]
    Upstream(String),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("failed to parse time series page")]
    Json(#[from] serde_json::Error),
}

/// Everything needed to query one metric of one service
#[derive(Debug, Clone)]
pub struct MetricQuery {
    service: Arc<ServiceDefinition>,
    metric: Arc<MetricDefinition>,
    dimensions: Vec<Dimension>,
    label_grouping: Vec<String>,
}

impl MetricQuery {
    pub fn new(service: Arc<ServiceDefinition>, metric: Arc<MetricDefinition>) -> Self {
        let mut dimensions: Vec<Dimension> = Vec::new();
        for dimension in service.dimensions().iter().chain(metric.dimensions()) {
            if !dimensions.contains(dimension) {
                dimensions.push(dimension.clone());
            }
        }

        Self {
            service,
            metric,
            dimensions,
            label_grouping: Vec::new(),
        }
    }

    /// Stop requesting and mapping the given dimension sources
    pub fn with_excluded_dimensions<'a>(mut self, sources: impl IntoIterator<Item = &'a String>) -> Self {
        for source in sources {
            self.dimensions.retain(|d| d.source() != source);
        }
        self
    }

    /// Extra label keys to group by, e.g. user labels selected for this service
    pub fn with_label_grouping(mut self, keys: impl IntoIterator<Item = String>) -> Self {
        self.label_grouping.extend(keys);
        self
    }

    pub fn service(&self) -> &ServiceDefinition {
        &self.service
    }

    pub fn metric(&self) -> &MetricDefinition {
        &self.metric
    }

    /// Effective dimensions of service and metric, deduplicated in configuration order
    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn group_by_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = Vec::new();
        let sources = self.dimensions.iter().map(Dimension::source);
        for field in sources.chain(self.label_grouping.iter().map(String::as_str)) {
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
        fields
    }

    pub fn filter(&self) -> String {
        format!(
            "metric.type = \"{}\" {}",
            self.metric.source_name(),
            self.service.monitoring_filter()
        )
        .trim()
        .to_string()
    }

    /// `[execution_time - ingest_delay - sample_period, execution_time - ingest_delay)`
    pub fn window(&self, execution_time: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let delay = TimeDelta::seconds(self.metric.ingest_delay().as_secs() as i64);
        let period = TimeDelta::seconds(self.metric.sample_period().as_secs() as i64);
        let end = execution_time - delay;
        (end - period, end)
    }

    pub fn params(&self, execution_time: DateTime<Utc>, page_token: Option<&str>) -> Vec<(String, String)> {
        let (start, end) = self.window(execution_time);
        let (aligner, reducer) = aggregation::select(self.metric.kind(), self.metric.value_type());

        let mut params = vec![
            ("filter".to_string(), self.filter()),
            ("interval.startTime".to_string(), start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("interval.endTime".to_string(), end.to_rfc3339_opts(SecondsFormat::Secs, true)),
            (
                "aggregation.alignmentPeriod".to_string(),
                format!("{}s", self.metric.sample_period().as_secs()),
            ),
            ("aggregation.perSeriesAligner".to_string(), aligner.as_str().to_string()),
            ("aggregation.crossSeriesReducer".to_string(), reducer.as_str().to_string()),
        ];
        for field in self.group_by_fields() {
            params.push(("aggregation.groupByFields".to_string(), field.to_string()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken".to_string(), token.to_string()));
        }
        params
    }
}

pub struct TimeSeriesFetcher {
    api: Arc<dyn MonitoringApi>,
    monitoring: Arc<SelfMonitoring>,
}

impl TimeSeriesFetcher {
    pub fn new(api: Arc<dyn MonitoringApi>, monitoring: Arc<SelfMonitoring>) -> Self {
        Self { api, monitoring }
    }

    /// Fetch every page of the query window, in page order
    pub async fn fetch(
        &self,
        project_id: &str,
        query: &MetricQuery,
        execution_time: DateTime<Utc>,
    ) -> Result<Vec<TimeSeries>, FetchError> {
        let mut series = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let params = query.params(execution_time, page_token.as_deref());
            let response = self.api.list_time_series(project_id, &params).await?;
            self.monitoring.record_request(API_MONITORING, response.status);

            if !response.is_success() {
                return Err(FetchError::Status {
                    status: response.status,
                    body: response.body_text(),
                });
            }

            let page: TimeSeriesPage = serde_json::from_slice(&response.body)?;
            if let Some(error) = page.error {
                return Err(FetchError::Upstream(error.to_string()));
            }
            series.extend(page.time_series);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(
            "Fetched {} series of {} in {project_id}",
            series.len(),
            query.metric().source_name()
        );
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricConfig, MetricKind, ServiceConfig, ValueType};
    use crate::test::FakeMonitoringApi;

    fn query(filter: &str) -> MetricQuery {
        let service = ServiceDefinition::new(ServiceConfig {
            name: "gce_instance".into(),
            technology_name: None,
            dimensions: vec![
                Dimension::from_source("resource.labels.zone"),
                Dimension::from_source("resource.labels.instance_id"),
            ],
            metrics: Vec::new(),
            enabled: true,
            monitoring_filter: filter.into(),
        })
        .unwrap();
        let metric = MetricDefinition::new(MetricConfig {
            source_name: "compute.googleapis.com/instance/cpu/utilization".into(),
            kind: MetricKind::Gauge,
            value_type: ValueType::Double,
            ingest_delay: 240,
            dimensions: vec![
                Dimension::from_source("resource.labels.zone"),
                Dimension::new("metric.labels.instance_name", "instance"),
            ],
            ..Default::default()
        })
        .unwrap();
        MetricQuery::new(Arc::new(service), Arc::new(metric))
    }

    fn execution_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2023-06-22T10:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn values<'a>(params: &'a [(String, String)], key: &str) -> Vec<&'a str> {
        params.iter().filter(|(k, _)| k == key).map(|(_, v)| v.as_str()).collect()
    }

    #[test]
    fn builds_query_parameters() {
        let query = query(" resource.labels.zone = \"europe-west1-b\" ")
            .with_label_grouping(["metadata.user_labels.team".to_string()]);
        let params = query.params(execution_time(), None);

        assert_eq!(
            values(&params, "filter"),
            vec!["metric.type = \"compute.googleapis.com/instance/cpu/utilization\" resource.labels.zone = \"europe-west1-b\""]
        );
        assert_eq!(values(&params, "interval.startTime"), vec!["2023-06-22T09:55:00Z"]);
        assert_eq!(values(&params, "interval.endTime"), vec!["2023-06-22T09:56:00Z"]);
        assert_eq!(values(&params, "aggregation.alignmentPeriod"), vec!["60s"]);
        assert_eq!(values(&params, "aggregation.perSeriesAligner"), vec!["ALIGN_MEAN"]);
        assert_eq!(values(&params, "aggregation.crossSeriesReducer"), vec!["REDUCE_MEAN"]);
        assert_eq!(
            values(&params, "aggregation.groupByFields"),
            vec![
                "resource.labels.zone",
                "resource.labels.instance_id",
                "metric.labels.instance_name",
                "metadata.user_labels.team"
            ]
        );
        assert!(values(&params, "pageToken").is_empty());
    }

    #[test]
    fn filter_without_service_filter_is_trimmed() {
        assert_eq!(
            query("").filter(),
            "metric.type = \"compute.googleapis.com/instance/cpu/utilization\""
        );
    }

    #[test]
    fn excluded_dimensions_leave_the_group_by() {
        let sources = vec!["resource.labels.zone".to_string()];
        let query = query("").with_excluded_dimensions(&sources);
        assert_eq!(
            query.group_by_fields(),
            vec!["resource.labels.instance_id", "metric.labels.instance_name"]
        );
    }

    #[tokio::test]
    async fn follows_every_page_in_order() {
        let api = Arc::new(FakeMonitoringApi::default());
        api.respond(200, r#"{"timeSeries": [{"resource": {"type": "a"}}], "nextPageToken": "p2"}"#);
        api.respond(200, r#"{"timeSeries": [{"resource": {"type": "b"}}, {"resource": {"type": "c"}}], "nextPageToken": "p3"}"#);
        api.respond(200, r#"{"timeSeries": [{"resource": {"type": "d"}}], "nextPageToken": ""}"#);

        let monitoring = Arc::new(SelfMonitoring::new());
        let fetcher = TimeSeriesFetcher::new(api.clone(), monitoring.clone());
        let series = fetcher.fetch("my-project", &query(""), execution_time()).await.unwrap();

        let kinds: Vec<&str> = series.iter().map(|s| s.resource.kind.as_str()).collect();
        assert_eq!(kinds, vec!["a", "b", "c", "d"]);

        let requests = api.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].0, "my-project");
        assert!(values(&requests[0].1, "pageToken").is_empty());
        assert_eq!(values(&requests[1].1, "pageToken"), vec!["p2"]);
        assert_eq!(values(&requests[2].1, "pageToken"), vec!["p3"]);
        assert_eq!(monitoring.snapshot().requests[&(API_MONITORING.to_string(), 200)], 3);
    }

    #[tokio::test]
    async fn upstream_error_fails_the_fetch() {
        let api = Arc::new(FakeMonitoringApi::default());
        api.respond(200, r#"{"timeSeries": [], "nextPageToken": "p2"}"#);
        api.respond(200, r#"{"error": {"code": 400, "message": "bad filter"}}"#);

        let fetcher = TimeSeriesFetcher::new(api, Arc::new(SelfMonitoring::new()));
        let error = fetcher.fetch("my-project", &query(""), execution_time()).await.unwrap_err();
        assert!(matches!(error, FetchError::Upstream(message) if message.contains("bad filter")));
    }

    #[tokio::test]
    async fn error_status_fails_the_fetch() {
        let api = Arc::new(FakeMonitoringApi::default());
        api.respond(403, "permission denied");

        let monitoring = Arc::new(SelfMonitoring::new());
        let fetcher = TimeSeriesFetcher::new(api, monitoring.clone());
        let error = fetcher.fetch("my-project", &query(""), execution_time()).await.unwrap_err();
        assert!(matches!(error, FetchError::Status { status: 403, .. }));
        assert_eq!(monitoring.snapshot().requests_for(API_MONITORING), 1);
    }
}
