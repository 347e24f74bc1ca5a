//! # Time series
//!
//! Response shapes of the Cloud Monitoring `projects.timeSeries.list` call
//!
//! <https://cloud.google.com/monitoring/api/ref_v3/rest/v3/projects.timeSeries/list>

use serde::{de, Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;

/// One page of a `timeSeries.list` response
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesPage {
    #[serde(default)]
    pub time_series: Vec<TimeSeries>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    /// Business error reported inside an otherwise successful response
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeries {
    #[serde(default)]
    pub metric: LabeledType,
    #[serde(default)]
    pub resource: LabeledType,
    #[serde(default)]
    pub metadata: SeriesMetadata,
    #[serde(default)]
    pub points: Vec<Point>,
}

/// The `metric` and `resource` objects share this shape
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LabeledType {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesMetadata {
    /// System labels may hold strings, booleans or lists
    #[serde(default)]
    pub system_labels: BTreeMap<String, Value>,
    #[serde(default)]
    pub user_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Point {
    pub interval: Interval,
    pub value: TypedValue,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interval {
    #[serde(default)]
    pub start_time: Option<String>,
    pub end_time: String,
}

/// Exactly one of the fields is set
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedValue {
    #[serde(default)]
    pub bool_value: Option<bool>,
    #[serde(default)]
    pub int64_value: Option<Int64>,
    #[serde(default)]
    pub double_value: Option<f64>,
    #[serde(default)]
    pub distribution_value: Option<Distribution>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    #[serde(default)]
    pub count: Int64,
    #[serde(default)]
    pub mean: Option<f64>,
    #[serde(default)]
    pub bucket_options: Option<BucketOptions>,
    #[serde(default)]
    pub bucket_counts: Vec<Int64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketOptions {
    #[serde(default)]
    pub exponential_buckets: Option<ExponentialBuckets>,
    #[serde(default)]
    pub linear_buckets: Option<LinearBuckets>,
    #[serde(default)]
    pub explicit_buckets: Option<ExplicitBuckets>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExponentialBuckets {
    pub num_finite_buckets: i64,
    pub growth_factor: f64,
    pub scale: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearBuckets {
    pub num_finite_buckets: i64,
    pub width: f64,
    pub offset: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExplicitBuckets {
    #[serde(default)]
    pub bounds: Vec<f64>,
}

/// 64 bit integers arrive as JSON strings, older payloads use plain numbers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Int64(pub i64);

impl<'de> Deserialize<'de> for Int64 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(i64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(Int64(value)),
            Repr::Text(text) => text.parse().map(Int64).map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_page() {
        let page: TimeSeriesPage = serde_json::from_str(
            r#"{
                "timeSeries": [{
                    "metric": {"type": "compute.googleapis.com/instance/disk/read_ops_count", "labels": {"device_name": "disk-1"}},
                    "resource": {"type": "gce_instance", "labels": {"project_id": "alpha", "zone": "us-east1-b"}},
                    "metadata": {"systemLabels": {"spot_instance": false, "name": "vm-1"}, "userLabels": {"team": "core"}},
                    "metricKind": "DELTA",
                    "valueType": "INT64",
                    "points": [{
                        "interval": {"startTime": "2024-05-01T10:00:00Z", "endTime": "2024-05-01T10:01:00Z"},
                        "value": {"int64Value": "17"}
                    }]
                }],
                "nextPageToken": "abc"
            }"#,
        )
        .unwrap();

        let series = &page.time_series[0];
        assert_eq!(page.next_page_token.as_deref(), Some("abc"));
        assert_eq!(series.resource.kind, "gce_instance");
        assert_eq!(series.metric.labels["device_name"], "disk-1");
        assert_eq!(series.metadata.system_labels["spot_instance"], Value::Bool(false));
        assert_eq!(series.points[0].value.int64_value, Some(Int64(17)));
        assert!(page.error.is_none());
    }

    #[test]
    fn parses_distribution() {
        let value: TypedValue = serde_json::from_str(
            r#"{"distributionValue": {
                "count": "5",
                "bucketOptions": {"explicitBuckets": {"bounds": [0, 10, 20, 30]}},
                "bucketCounts": ["0", 2, "3", "0"]
            }}"#,
        )
        .unwrap();

        let distribution = value.distribution_value.unwrap();
        assert_eq!(distribution.count, Int64(5));
        assert_eq!(distribution.mean, None);
        assert_eq!(distribution.bucket_counts, vec![Int64(0), Int64(2), Int64(3), Int64(0)]);
        assert_eq!(
            distribution.bucket_options.unwrap().explicit_buckets.unwrap().bounds,
            vec![0.0, 10.0, 20.0, 30.0]
        );
    }

    #[test]
    fn rejects_non_numeric_int64() {
        assert!(serde_json::from_str::<Int64>(r#""seventeen""#).is_err());
    }
}
