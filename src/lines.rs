//! # Lines
//!
//! Conversion of fetched time series into MINT lines

use super::dimensions::{DimensionMapper, DimensionSanitizer};
use super::distribution;
use super::entity;
use super::fetcher::MetricQuery;
use super::mint::{DimensionValue, IngestLine};
use super::timeseries::TimeSeries;
use chrono::DateTime;
use serde_json::Value;
use tracing::{debug, warn};

pub const RESOURCE_TYPE: &str = "gcp.resource.type";
pub const ORIGIN: &str = "metadata.origin";
pub const SECURITY_CONTEXT: &str = "dt.security_context";

const ORIGIN_AUTODISCOVERY: &str = "autodiscovery";
const ORIGIN_EXTENSION: &str = "extension";

/// Builds the lines of one metric query
pub struct IngestLineBuilder<'a> {
    query: &'a MetricQuery,
    sanitizer: &'a DimensionSanitizer,
    security_context: &'a str,
    mapper: DimensionMapper,
}

impl<'a> IngestLineBuilder<'a> {
    pub fn new(query: &'a MetricQuery, sanitizer: &'a DimensionSanitizer, security_context: &'a str) -> Self {
        Self {
            query,
            sanitizer,
            security_context,
            mapper: DimensionMapper::new(query.dimensions()),
        }
    }

    /// One line per point with a value, points of a series share its dimensions
    pub fn build(&self, series: &[TimeSeries]) -> Vec<IngestLine> {
        let metric = self.query.metric();
        let mut lines = Vec::new();

        for series in series {
            let entity_id = entity::entity_id(self.query.service(), &series.resource.labels);
            let dimensions = self.dimensions(series);

            for point in &series.points {
                let timestamp = match DateTime::parse_from_rfc3339(&point.interval.end_time) {
                    Ok(end_time) => end_time.timestamp_millis(),
                    Err(e) => {
                        warn!(
                            "Skipping point of {} with invalid end time {}: {e}",
                            metric.source_name(),
                            point.interval.end_time
                        );
                        continue;
                    }
                };

                let Some(value) = distribution::extract(&point.value, metric) else {
                    continue;
                };

                lines.push(IngestLine {
                    entity_id: entity_id.clone(),
                    metric_name: metric.target_name().to_string(),
                    metric_type: metric.mint_type(),
                    value,
                    timestamp,
                    dimensions: dimensions.clone(),
                });
            }
        }

        debug!("Built {} lines for {}", lines.len(), metric.source_name());
        lines
    }

    fn dimensions(&self, series: &TimeSeries) -> Vec<DimensionValue> {
        let origin = if self.query.metric().autodiscovered() {
            ORIGIN_AUTODISCOVERY
        } else {
            ORIGIN_EXTENSION
        };

        let mut dimensions = Vec::new();
        // first occurrence of a name wins, compared after truncation
        let mut push = |name: &str, value: &str| {
            let Some(dimension) = self.sanitizer.dimension(name, value) else {
                return;
            };
            if !dimensions.iter().any(|d: &DimensionValue| d.name == dimension.name) {
                dimensions.push(dimension);
            }
        };

        push(RESOURCE_TYPE, self.query.service().name());
        push(ORIGIN, origin);
        push(SECURITY_CONTEXT, self.security_context);

        for (key, value) in &series.metric.labels {
            for name in self.mapper.get(&format!("metric.labels.{key}"), key) {
                push(name, value.as_str());
            }
        }
        for (key, value) in &series.resource.labels {
            for name in self.mapper.get(&format!("resource.labels.{key}"), key) {
                push(name, value.as_str());
            }
        }
        for (key, value) in &series.metadata.system_labels {
            let value = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            for name in self.mapper.get(&format!("metadata.systemLabels.{key}"), key) {
                push(name, value.as_str());
            }
        }
        for (key, value) in &series.metadata.user_labels {
            push(key.as_str(), value.as_str());
        }

        dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::SelfMonitoring;
    use crate::dimensions::DimensionLimits;
    use crate::model::{
        Dimension, MetricConfig, MetricDefinition, MetricKind, ServiceConfig, ServiceDefinition, ValueType,
    };
    use crate::timeseries::TimeSeriesPage;
    use std::sync::Arc;

    fn query(autodiscovered: bool) -> MetricQuery {
        let service = ServiceDefinition::new(ServiceConfig {
            name: "gce_instance".into(),
            technology_name: None,
            dimensions: vec![
                Dimension::from_source("resource.labels.zone"),
                Dimension::from_source("resource.labels.instance_id"),
            ],
            metrics: Vec::new(),
            enabled: true,
            monitoring_filter: String::new(),
        })
        .unwrap();
        let metric = MetricDefinition::new(MetricConfig {
            source_name: "compute.googleapis.com/instance/disk/read_bytes_count".into(),
            kind: MetricKind::Delta,
            value_type: ValueType::Int64,
            dimensions: vec![Dimension::new("metric.labels.device_name", "device")],
            autodiscovered,
            ..Default::default()
        })
        .unwrap();
        MetricQuery::new(Arc::new(service), Arc::new(metric))
    }

    fn series() -> Vec<TimeSeries> {
        let page: TimeSeriesPage = serde_json::from_str(
            r#"{"timeSeries": [{
                "metric": {"type": "compute.googleapis.com/instance/disk/read_bytes_count", "labels": {"device_name": "disk-1", "storage_type": "pd-ssd"}},
                "resource": {"type": "gce_instance", "labels": {"instance_id": "1234", "zone": "europe-west1-b"}},
                "metadata": {"systemLabels": {"name": "vm-1", "spot": false}, "userLabels": {"team": "core"}},
                "points": [
                    {"interval": {"endTime": "2023-06-22T09:56:00.123Z"}, "value": {"int64Value": "2048"}},
                    {"interval": {"endTime": "not a time"}, "value": {"int64Value": "1"}},
                    {"interval": {"endTime": "2023-06-22T09:55:00Z"}, "value": {}}
                ]
            }]}"#,
        )
        .unwrap();
        page.time_series
    }

    #[test]
    fn builds_lines_with_ordered_dimensions() {
        let query = query(false);
        let sanitizer = DimensionSanitizer::new(DimensionLimits::default(), Arc::new(SelfMonitoring::new()));
        let lines = IngestLineBuilder::new(&query, &sanitizer, "gcp_extension").build(&series());

        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0].to_string(),
            r#"cloud.gcp.compute_googleapis_com.instance.disk.read_bytes_count,gcp.resource.type="gce_instance",metadata.origin="extension",dt.security_context="gcp_extension",device="disk-1",storage_type="pd-ssd",instance_id="1234",zone="europe-west1-b",name="vm-1",spot="false",team="core" count,delta=2048 1687427760123"#
        );
        assert_eq!(
            lines[0].entity_id,
            entity::entity_id(query.service(), &series()[0].resource.labels)
        );
    }

    #[test]
    fn autodiscovered_origin() {
        let query = query(true);
        let sanitizer = DimensionSanitizer::new(DimensionLimits::default(), Arc::new(SelfMonitoring::new()));
        let lines = IngestLineBuilder::new(&query, &sanitizer, "gcp_extension").build(&series());
        assert_eq!(lines[0].dimensions[1], DimensionValue::new(ORIGIN, "autodiscovery"));
    }

    #[test]
    fn truncated_dimensions_are_counted() {
        let query = query(false);
        let monitoring = Arc::new(SelfMonitoring::new());
        let limits = DimensionLimits {
            max_name_length: 100,
            max_value_length: 4,
        };
        let sanitizer = DimensionSanitizer::new(limits, monitoring.clone());
        let lines = IngestLineBuilder::new(&query, &sanitizer, "gcp_extension").build(&series());

        assert_eq!(lines[0].dimensions[0], DimensionValue::new(RESOURCE_TYPE, "gce_"));
        assert!(monitoring.snapshot().dimension_value_truncations > 0);
    }

    #[test]
    fn names_colliding_after_truncation_keep_the_first() {
        let query = query(false);
        let limits = DimensionLimits {
            max_name_length: 13,
            max_value_length: 250,
        };
        let sanitizer = DimensionSanitizer::new(limits, Arc::new(SelfMonitoring::new()));
        let page: TimeSeriesPage = serde_json::from_str(
            r#"{"timeSeries": [{
                "metric": {"labels": {"response_code": "200", "response_code_class": "2xx"}},
                "resource": {"type": "gce_instance"},
                "points": [{"interval": {"endTime": "2023-06-22T09:56:00Z"}, "value": {"int64Value": "1"}}]
            }]}"#,
        )
        .unwrap();
        let lines = IngestLineBuilder::new(&query, &sanitizer, "gcp_extension").build(&page.time_series);

        let names: Vec<&str> = lines[0].dimensions.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["gcp.resource.", "metadata.orig", "dt.security_c", "response_code"]);
        assert_eq!(lines[0].dimensions[3].value, "200");
    }
}
