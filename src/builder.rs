use super::dimensions::DimensionLimits;
use super::model::MetricExclusion;
use super::Error;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

#[cfg(feature = "http")]
use super::{entity::ExtractorRegistry, http::TokenProvider, orchestrator::Orchestrator};

const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_MAX_CONCURRENT_FLUSHES: usize = 4;
const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 100;
const DEFAULT_SECURITY_CONTEXT: &str = "gcp_extension";

/// Configuration of a polling deployment, see [Builder]
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub ingest_url: String,
    pub api_token: String,
    pub metric_ingest_batch_size: usize,
    /// `None` delivers without pacing
    pub max_metric_lines_per_minute: Option<u32>,
    pub max_concurrent_flushes: usize,
    pub max_concurrent_fetches: usize,
    pub dimension_limits: DimensionLimits,
    pub security_context: String,
    /// Only these projects are polled when not empty
    pub included_projects: BTreeSet<String>,
    pub excluded_projects: BTreeSet<String>,
    pub exclusions: Vec<MetricExclusion>,
    /// Extra group by keys by service name
    pub label_grouping: BTreeMap<String, Vec<String>>,
    pub monitoring_api_url: String,
}

impl Config {
    pub fn project_enabled(&self, project_id: &str) -> bool {
        if !self.included_projects.is_empty() && !self.included_projects.contains(project_id) {
            return false;
        }
        !self.excluded_projects.contains(project_id)
    }
}

/// Builder for the polling [Orchestrator](crate::Orchestrator)
///
/// # Example
/// ```
/// let config = metrics_gcp_mint::Builder::new()
///     .ingest_url("https://tenant.example.com")
///     .api_token("dt0c01.TOKEN")
///     .metric_ingest_batch_size(500)
///     .exclude_project("sandbox")
///     .build()
///     .unwrap();
///
/// assert!(!config.project_enabled("sandbox"));
/// ```
#[derive(Debug, Default)]
pub struct Builder {
    ingest_url: Option<String>,
    api_token: Option<String>,
    metric_ingest_batch_size: Option<usize>,
    max_metric_lines_per_minute: Option<u32>,
    max_concurrent_flushes: Option<usize>,
    max_concurrent_fetches: Option<usize>,
    dimension_limits: DimensionLimits,
    security_context: Option<String>,
    included_projects: BTreeSet<String>,
    excluded_projects: BTreeSet<String>,
    exclusions: Vec<MetricExclusion>,
    label_grouping: BTreeMap<String, Vec<String>>,
    monitoring_api_url: Option<String>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a builder from the environment
    ///
    /// `INGEST_URL`, `INGEST_API_TOKEN`, `METRIC_INGEST_BATCH_SIZE`, `MAX_DIMENSION_NAME_LENGTH`,
    /// `MAX_DIMENSION_VALUE_LENGTH`, `MAX_METRIC_LINES_PER_MINUTE`, `MAX_CONCURRENT_FLUSHES`,
    /// `MAX_CONCURRENT_FETCHES`, `SECURITY_CONTEXT`, and the comma separated
    /// `INCLUDED_PROJECTS` and `EXCLUDED_PROJECTS`. Setters called afterwards take precedence.
    pub fn from_env() -> Result<Self, Error> {
        let mut builder = Builder::new();
        builder.ingest_url = env_string("INGEST_URL");
        builder.api_token = env_string("INGEST_API_TOKEN");
        builder.metric_ingest_batch_size = env_parse("METRIC_INGEST_BATCH_SIZE")?;
        builder.max_metric_lines_per_minute = env_parse("MAX_METRIC_LINES_PER_MINUTE")?;
        builder.max_concurrent_flushes = env_parse("MAX_CONCURRENT_FLUSHES")?;
        builder.max_concurrent_fetches = env_parse("MAX_CONCURRENT_FETCHES")?;
        builder.security_context = env_string("SECURITY_CONTEXT");
        if let Some(length) = env_parse("MAX_DIMENSION_NAME_LENGTH")? {
            builder.dimension_limits.max_name_length = length;
        }
        if let Some(length) = env_parse("MAX_DIMENSION_VALUE_LENGTH")? {
            builder.dimension_limits.max_value_length = length;
        }
        builder.included_projects = env_list("INCLUDED_PROJECTS");
        builder.excluded_projects = env_list("EXCLUDED_PROJECTS");
        Ok(builder)
    }

    /// Sets the tenant url the ingest path is appended to
    /// * Must be set or build() will return Err("ingest_url missing")
    pub fn ingest_url(self, url: impl Into<String>) -> Self {
        Self {
            ingest_url: Some(url.into()),
            ..self
        }
    }

    /// Sets the ingest API token
    /// * Must be set or build() will return Err("api_token missing")
    pub fn api_token(self, token: impl Into<String>) -> Self {
        Self {
            api_token: Some(token.into()),
            ..self
        }
    }

    /// Maximum lines per POST, defaults to 1000
    pub fn metric_ingest_batch_size(self, size: usize) -> Self {
        Self {
            metric_ingest_batch_size: Some(size),
            ..self
        }
    }

    /// Lines per minute budget of the pacer, unpaced when never set
    pub fn max_metric_lines_per_minute(self, lines: u32) -> Self {
        Self {
            max_metric_lines_per_minute: Some(lines),
            ..self
        }
    }

    /// Flushes in flight at once, defaults to 4
    pub fn max_concurrent_flushes(self, flushes: usize) -> Self {
        Self {
            max_concurrent_flushes: Some(flushes),
            ..self
        }
    }

    /// Metric fetches in flight at once, defaults to 100
    pub fn max_concurrent_fetches(self, fetches: usize) -> Self {
        Self {
            max_concurrent_fetches: Some(fetches),
            ..self
        }
    }

    /// Dimension name and value length limits, default to 100 and 250 characters
    pub fn dimension_limits(self, limits: DimensionLimits) -> Self {
        Self {
            dimension_limits: limits,
            ..self
        }
    }

    /// Value of the `dt.security_context` dimension, defaults to `gcp_extension`
    pub fn security_context(self, context: impl Into<String>) -> Self {
        Self {
            security_context: Some(context.into()),
            ..self
        }
    }

    /// Restricts polling to the included projects
    /// * This method can be called multiple times
    pub fn include_project(mut self, project_id: impl Into<String>) -> Self {
        self.included_projects.insert(project_id.into());
        self
    }

    /// Never polls the given project, even when included
    pub fn exclude_project(mut self, project_id: impl Into<String>) -> Self {
        self.excluded_projects.insert(project_id.into());
        self
    }

    /// Excludes a metric, or some of its dimensions when the exclusion lists any
    pub fn with_exclusion(mut self, exclusion: MetricExclusion) -> Self {
        self.exclusions.push(exclusion);
        self
    }

    /// Groups the metrics of a service by an extra label key, e.g. `metadata.user_labels.team`
    pub fn with_label_grouping(mut self, service: impl Into<String>, key: impl Into<String>) -> Self {
        self.label_grouping.entry(service.into()).or_default().push(key.into());
        self
    }

    /// Overrides the Cloud Monitoring API base url
    pub fn monitoring_api_url(self, url: impl Into<String>) -> Self {
        Self {
            monitoring_api_url: Some(url.into()),
            ..self
        }
    }

    /// Consumes the builder into a validated [Config]
    pub fn build(self) -> Result<Config, Error> {
        let config = Config {
            ingest_url: self.ingest_url.ok_or("ingest_url missing")?,
            api_token: self.api_token.ok_or("api_token missing")?,
            metric_ingest_batch_size: self.metric_ingest_batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            max_metric_lines_per_minute: self.max_metric_lines_per_minute,
            max_concurrent_flushes: self.max_concurrent_flushes.unwrap_or(DEFAULT_MAX_CONCURRENT_FLUSHES),
            max_concurrent_fetches: self.max_concurrent_fetches.unwrap_or(DEFAULT_MAX_CONCURRENT_FETCHES),
            dimension_limits: self.dimension_limits,
            security_context: self
                .security_context
                .unwrap_or_else(|| DEFAULT_SECURITY_CONTEXT.to_string()),
            included_projects: self.included_projects,
            excluded_projects: self.excluded_projects,
            exclusions: self.exclusions,
            label_grouping: self.label_grouping,
            monitoring_api_url: self
                .monitoring_api_url
                .unwrap_or_else(|| super::http::MONITORING_API_URL.to_string()),
        };

        if config.metric_ingest_batch_size == 0 {
            return Err("metric_ingest_batch_size must be positive".into());
        }
        if config.max_concurrent_flushes == 0 || config.max_concurrent_fetches == 0 {
            return Err("concurrency limits must be positive".into());
        }
        if config.dimension_limits.max_name_length == 0 || config.dimension_limits.max_value_length == 0 {
            return Err("dimension length limits must be positive".into());
        }
        Ok(config)
    }

    /// Builds the configuration and an orchestrator talking to the real endpoints over one
    /// shared [reqwest::Client] per upstream
    #[cfg(feature = "http")]
    pub fn init(
        self,
        tokens: impl TokenProvider + 'static,
        extractors: ExtractorRegistry,
    ) -> Result<Orchestrator, Error> {
        use super::http::{ReqwestIngestApi, ReqwestMonitoringApi};
        use std::sync::Arc;

        let config = self.build()?;
        let monitoring_api = ReqwestMonitoringApi::new(
            reqwest::Client::new(),
            config.monitoring_api_url.clone(),
            Arc::new(tokens),
        );
        let ingest_api = ReqwestIngestApi::new(reqwest::Client::new(), &config.ingest_url);
        Ok(Orchestrator::new(config, Arc::new(monitoring_api), Arc::new(ingest_api), extractors))
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>, Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(name) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|e| format!("{name} has an invalid value {value}: {e}").into()),
        None => Ok(None),
    }
}

fn env_list(name: &str) -> BTreeSet<String> {
    env_string(name)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}
