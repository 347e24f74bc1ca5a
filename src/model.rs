//! # Model
//!
//! Service and metric definitions handed to the pipeline by the configuration loader and by
//! metric autodiscovery. Values are validated and their derived fields computed once, in the
//! constructors; nothing mutates them afterwards.

use super::{mint::MintType, Error};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Unit Cloud Monitoring uses for ratios expressed in hundredths of a percent
pub const UNIT_HUNDREDTHS_OF_PERCENT: &str = "10^2.%";

/// Prefix of every metric name derived from a Cloud Monitoring metric type
const TARGET_NAME_PREFIX: &str = "cloud.gcp.";

/// Longest ingest delay or sample period accepted from configuration
const MAX_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Cloud Monitoring metric kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    Gauge,
    Delta,
    Cumulative,
    #[default]
    #[serde(other)]
    Unspecified,
}

/// Cloud Monitoring value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Bool,
    Int64,
    Double,
    String,
    Distribution,
    Money,
    #[default]
    #[serde(other)]
    Unspecified,
}

/// A label to request from Cloud Monitoring and the dimension name it is delivered under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DimensionConfig")]
pub struct Dimension {
    source: String,
    target: String,
}

#[derive(Deserialize)]
struct DimensionConfig {
    source: String,
    target: Option<String>,
}

impl From<DimensionConfig> for Dimension {
    fn from(config: DimensionConfig) -> Self {
        match config.target {
            Some(target) => Dimension::new(config.source, target),
            None => Dimension::from_source(config.source),
        }
    }
}

impl Dimension {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }

    /// Dimension named after the last path segment of its source, `resource.labels.zone` → `zone`
    pub fn from_source(source: impl Into<String>) -> Self {
        let source = source.into();
        let target = last_segment(&source).to_string();
        Self { source, target }
    }

    /// Source key, e.g. `resource.labels.zone`
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Dimension name on the MINT line
    pub fn target(&self) -> &str {
        &self.target
    }
}

/// Trailing segment of a dotted label path
pub fn last_segment(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

/// Raw metric configuration as written by the configuration loader or autodiscovery
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricConfig {
    /// Cloud Monitoring metric type, e.g. `compute.googleapis.com/instance/cpu/utilization`
    pub source_name: String,
    /// MINT metric name, derived from `source_name` when absent
    pub target_name: Option<String>,
    pub kind: MetricKind,
    pub value_type: ValueType,
    pub unit: Option<String>,
    /// Seconds Cloud Monitoring needs before a sample becomes queryable
    pub ingest_delay: u64,
    /// Alignment period in seconds, defaults to one minute
    pub sample_period: Option<u64>,
    pub dimensions: Vec<Dimension>,
    pub autodiscovered: bool,
    /// Projects an autodiscovered metric was found in
    pub project_ids: Option<Vec<String>>,
}

/// One monitored Cloud Monitoring metric type
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "MetricConfig")]
pub struct MetricDefinition {
    source_name: String,
    target_name: String,
    api: String,
    kind: MetricKind,
    value_type: ValueType,
    mint_type: MintType,
    unit: Option<String>,
    ingest_delay: Duration,
    sample_period: Duration,
    dimensions: Vec<Dimension>,
    autodiscovered: bool,
    project_ids: Option<BTreeSet<String>>,
}

impl TryFrom<MetricConfig> for MetricDefinition {
    type Error = Error;

    fn try_from(config: MetricConfig) -> Result<Self, Self::Error> {
        MetricDefinition::new(config)
    }
}

impl MetricDefinition {
    pub fn new(config: MetricConfig) -> Result<Self, Error> {
        let source_name = config.source_name.trim().to_string();
        if source_name.is_empty() {
            return Err("metric source name missing".into());
        }

        let ingest_delay = Duration::from_secs(config.ingest_delay);
        let sample_period = Duration::from_secs(config.sample_period.unwrap_or(60));
        if sample_period.is_zero() || sample_period > MAX_PERIOD {
            return Err(format!("metric {source_name} has an invalid sample period {sample_period:?}").into());
        }
        if ingest_delay > MAX_PERIOD {
            return Err(format!("metric {source_name} has an invalid ingest delay {ingest_delay:?}").into());
        }

        let target_name = match config.target_name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => derive_target_name(&source_name),
        };

        let mint_type = match (config.value_type, config.kind) {
            (ValueType::Distribution, _) => MintType::Gauge,
            (_, MetricKind::Delta | MetricKind::Cumulative) => MintType::Count,
            _ => MintType::Gauge,
        };

        let api = source_name.split('/').next().unwrap_or_default().to_string();

        Ok(Self {
            api,
            target_name,
            kind: config.kind,
            value_type: config.value_type,
            mint_type,
            unit: config.unit,
            ingest_delay,
            sample_period,
            dimensions: config.dimensions,
            autodiscovered: config.autodiscovered,
            project_ids: config.project_ids.map(|ids| ids.into_iter().collect()),
            source_name,
        })
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Cloud API serving this metric, e.g. `compute.googleapis.com`
    pub fn api(&self) -> &str {
        &self.api
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn mint_type(&self) -> MintType {
        self.mint_type
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn is_hundredths_of_percent(&self) -> bool {
        self.unit() == Some(UNIT_HUNDREDTHS_OF_PERCENT)
    }

    pub fn ingest_delay(&self) -> Duration {
        self.ingest_delay
    }

    pub fn sample_period(&self) -> Duration {
        self.sample_period
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn autodiscovered(&self) -> bool {
        self.autodiscovered
    }

    /// Autodiscovered metrics are only queried in the projects they were discovered in
    pub fn enabled_for_project(&self, project_id: &str) -> bool {
        match (&self.project_ids, self.autodiscovered) {
            (Some(ids), true) => ids.contains(project_id),
            _ => true,
        }
    }
}

/// `compute.googleapis.com/instance/cpu/utilization` → `cloud.gcp.compute_googleapis_com.instance.cpu.utilization`
fn derive_target_name(source_name: &str) -> String {
    let (api, path) = source_name.split_once('/').unwrap_or((source_name, ""));
    let mut name = String::with_capacity(TARGET_NAME_PREFIX.len() + source_name.len());
    name.push_str(TARGET_NAME_PREFIX);
    name.push_str(&api.replace('.', "_"));
    if !path.is_empty() {
        name.push('.');
        name.push_str(&path.replace('/', "."));
    }
    name
}

/// Raw service configuration as written by the configuration loader
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Monitored resource type, e.g. `gce_instance`
    pub name: String,
    #[serde(default)]
    pub technology_name: Option<String>,
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub monitoring_filter: String,
}

fn default_enabled() -> bool {
    true
}

/// A monitored GCP service (monitored resource type)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "ServiceConfig")]
pub struct ServiceDefinition {
    name: String,
    technology_name: String,
    dimensions: Vec<Dimension>,
    metrics: Vec<MetricDefinition>,
    enabled: bool,
    monitoring_filter: String,
}

impl TryFrom<ServiceConfig> for ServiceDefinition {
    type Error = Error;

    fn try_from(config: ServiceConfig) -> Result<Self, Self::Error> {
        ServiceDefinition::new(config)
    }
}

impl ServiceDefinition {
    pub fn new(config: ServiceConfig) -> Result<Self, Error> {
        let name = config.name.trim().to_string();
        if name.is_empty() {
            return Err("service name missing".into());
        }

        Ok(Self {
            technology_name: config.technology_name.unwrap_or_else(|| name.clone()),
            name,
            dimensions: config.dimensions,
            metrics: config.metrics,
            enabled: config.enabled,
            monitoring_filter: config.monitoring_filter.trim().to_string(),
        })
    }

    /// Consumes the definition and returns one that also polls the given autodiscovered metrics
    pub fn with_metrics(self, metrics: impl IntoIterator<Item = MetricDefinition>) -> Self {
        let mut all = self.metrics;
        for metric in metrics {
            if !all.iter().any(|known| known.source_name() == metric.source_name()) {
                all.push(metric);
            }
        }
        Self { metrics: all, ..self }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn technology_name(&self) -> &str {
        &self.technology_name
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn metrics(&self) -> &[MetricDefinition] {
        &self.metrics
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn monitoring_filter(&self) -> &str {
        &self.monitoring_filter
    }
}

/// Excludes metrics by type prefix, or only some of their dimensions when any are listed
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricExclusion {
    pub metric: String,
    #[serde(default)]
    pub dimensions: Vec<String>,
}

impl MetricExclusion {
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            dimensions: Vec::new(),
        }
    }

    /// Keep the metric but stop requesting the given dimension sources
    pub fn with_dimension(mut self, source: impl Into<String>) -> Self {
        self.dimensions.push(source.into());
        self
    }

    pub fn matches(&self, metric: &MetricDefinition) -> bool {
        !self.metric.is_empty() && metric.source_name().starts_with(&self.metric)
    }

    /// True when the whole metric is excluded rather than some of its dimensions
    pub fn excludes_metric(&self) -> bool {
        self.dimensions.is_empty()
    }
}
