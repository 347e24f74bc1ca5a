//! # Orchestrator
//!
//! Drives one polling cycle: fetch every enabled metric of every project, correlate the lines
//! with topology and deliver them, tolerating the failure of any single fetch.

use super::builder::Config;
use super::collector::{SelfMonitoring, SelfMonitoringCounters};
use super::delivery::{DeliveryClient, IngestApi};
use super::dimensions::DimensionSanitizer;
use super::entity::{self, ExtractorRegistry};
use super::fetcher::{MetricQuery, MonitoringApi, TimeSeriesFetcher};
use super::lines::IngestLineBuilder;
use super::mint::IngestLine;
use super::model::{MetricDefinition, ServiceDefinition};
use super::pacer::DeliveryPacer;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

const PHASE_FETCH: &str = "fetch";
const PHASE_TOPOLOGY: &str = "topology";
const PHASE_PUSH: &str = "push";

/// A GCP project to poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Project {
    pub id: String,
    /// Cloud APIs not enabled in the project, e.g. `cloudsql.googleapis.com`
    pub disabled_apis: HashSet<String>,
}

impl Project {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            disabled_apis: HashSet::new(),
        }
    }

    pub fn with_disabled_api(mut self, api: impl Into<String>) -> Self {
        self.disabled_apis.insert(api.into());
        self
    }
}

/// Outcome of one cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub lines_built: u64,
    pub lines_ok: u64,
    pub lines_invalid: u64,
    pub lines_dropped: u64,
    pub failed_fetches: u64,
    /// Self monitoring counters at the end of the cycle
    pub counters: SelfMonitoringCounters,
}

pub struct Orchestrator {
    config: Arc<Config>,
    monitoring: Arc<SelfMonitoring>,
    fetcher: Arc<TimeSeriesFetcher>,
    sanitizer: Arc<DimensionSanitizer>,
    delivery: Arc<DeliveryClient>,
    extractors: ExtractorRegistry,
    fetches: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        monitoring_api: Arc<dyn MonitoringApi>,
        ingest_api: Arc<dyn IngestApi>,
        extractors: ExtractorRegistry,
    ) -> Self {
        let monitoring = Arc::new(SelfMonitoring::new());
        let fetcher = TimeSeriesFetcher::new(monitoring_api, monitoring.clone());
        let sanitizer = DimensionSanitizer::new(config.dimension_limits, monitoring.clone());
        let delivery = DeliveryClient::new(
            ingest_api,
            config.api_token.clone(),
            config.metric_ingest_batch_size,
            monitoring.clone(),
        )
        .with_pacer(Arc::new(DeliveryPacer::new(
            config.max_metric_lines_per_minute,
            config.max_concurrent_flushes,
        )));
        let fetches = Semaphore::new(config.max_concurrent_fetches);

        Self {
            config: Arc::new(config),
            monitoring,
            fetcher: Arc::new(fetcher),
            sanitizer: Arc::new(sanitizer),
            delivery: Arc::new(delivery),
            extractors,
            fetches: Arc::new(fetches),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn monitoring(&self) -> &Arc<SelfMonitoring> {
        &self.monitoring
    }

    /// Delivery client, e.g. to install a refreshed token
    pub fn delivery(&self) -> &DeliveryClient {
        &self.delivery
    }

    /// Run one polling cycle for the given projects and services
    pub async fn run_cycle(
        &self,
        projects: &[Project],
        services: &[Arc<ServiceDefinition>],
        execution_time: DateTime<Utc>,
    ) -> CycleReport {
        self.monitoring.reset();
        let mut report = CycleReport::default();

        let services: Vec<Arc<ServiceDefinition>> = services.iter().filter(|s| s.enabled()).cloned().collect();
        let projects: Vec<&Project> = projects
            .iter()
            .filter(|project| {
                let enabled = self.config.project_enabled(&project.id);
                if !enabled {
                    debug!("Skipping project {}", project.id);
                }
                enabled
            })
            .collect();

        let start = Instant::now();
        let mut lines_by_project = self.fetch(&projects, &services, execution_time, &mut report).await;
        self.monitoring.record_phase(PHASE_FETCH, start.elapsed());

        if !self.extractors.is_empty() {
            let start = Instant::now();
            let services = &services;
            let topologies = join_all(lines_by_project.keys().map(|project_id| async move {
                (project_id.clone(), self.extractors.entities(project_id, services).await)
            }))
            .await;
            for (project_id, entities) in topologies {
                if let Some(lines) = lines_by_project.get_mut(&project_id) {
                    entity::enrich(lines, &entities, &self.sanitizer);
                }
            }
            self.monitoring.record_phase(PHASE_TOPOLOGY, start.elapsed());
        }

        report.lines_built = lines_by_project.values().map(|lines| lines.len() as u64).sum();

        let start = Instant::now();
        self.push(lines_by_project, &mut report).await;
        self.monitoring.record_phase(PHASE_PUSH, start.elapsed());

        report.counters = self.monitoring.snapshot();
        info!(
            "Cycle done: {} lines built, {} ok, {} invalid, {} dropped, {} failed fetches",
            report.lines_built, report.lines_ok, report.lines_invalid, report.lines_dropped, report.failed_fetches
        );
        report
    }

    /// Query for one metric in one project, `None` when the metric is not polled there
    fn query(
        &self,
        project: &Project,
        service: &Arc<ServiceDefinition>,
        metric: &MetricDefinition,
    ) -> Option<MetricQuery> {
        if project.disabled_apis.contains(metric.api()) {
            debug!("Skipping {} in {}, {} is disabled", metric.source_name(), project.id, metric.api());
            return None;
        }
        if !metric.enabled_for_project(&project.id) {
            return None;
        }

        let exclusions: Vec<_> = self.config.exclusions.iter().filter(|e| e.matches(metric)).collect();
        if exclusions.iter().any(|e| e.excludes_metric()) {
            debug!("Skipping excluded {}", metric.source_name());
            return None;
        }

        let grouping = self.config.label_grouping.get(service.name()).cloned().unwrap_or_default();
        let query = MetricQuery::new(service.clone(), Arc::new(metric.clone()))
            .with_excluded_dimensions(exclusions.iter().flat_map(|e| &e.dimensions))
            .with_label_grouping(grouping);
        Some(query)
    }

    /// One task per (project, service, metric), lines grouped by project in spawn order
    async fn fetch(
        &self,
        projects: &[&Project],
        services: &[Arc<ServiceDefinition>],
        execution_time: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> BTreeMap<String, Vec<IngestLine>> {
        let mut tasks = JoinSet::new();
        let mut spawned = 0usize;

        for project in projects {
            for service in services {
                for metric in service.metrics() {
                    let Some(query) = self.query(project, service, metric) else {
                        continue;
                    };

                    let index = spawned;
                    spawned += 1;
                    let project_id = project.id.clone();
                    let fetcher = self.fetcher.clone();
                    let sanitizer = self.sanitizer.clone();
                    let config = self.config.clone();
                    let fetches = self.fetches.clone();

                    tasks.spawn(async move {
                        // the semaphore is never closed
                        let _permit = fetches.acquire_owned().await.ok();
                        let result = fetcher.fetch(&project_id, &query, execution_time).await.map(|series| {
                            IngestLineBuilder::new(&query, &sanitizer, &config.security_context).build(&series)
                        });
                        (index, project_id, query.metric().source_name().to_string(), result)
                    });
                }
            }
        }

        let mut results = Vec::with_capacity(spawned);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, project_id, _, Ok(lines))) => results.push((index, project_id, lines)),
                Ok((_, project_id, metric, Err(e))) => {
                    error!(project = %project_id, metric = %metric, "Fetching {metric} in {project_id} failed: {e}");
                    self.monitoring.record_fetch_failure();
                    report.failed_fetches += 1;
                }
                Err(e) => {
                    error!("Fetch task failed: {e}");
                    self.monitoring.record_fetch_failure();
                    report.failed_fetches += 1;
                }
            }
        }

        results.sort_by_key(|(index, _, _)| *index);
        let mut lines_by_project: BTreeMap<String, Vec<IngestLine>> = BTreeMap::new();
        for (_, project_id, lines) in results {
            lines_by_project.entry(project_id).or_default().extend(lines);
        }
        lines_by_project
    }

    /// One push per project, batches paced by the delivery client
    async fn push(&self, lines_by_project: BTreeMap<String, Vec<IngestLine>>, report: &mut CycleReport) {
        let mut tasks = JoinSet::new();

        for (project_id, lines) in lines_by_project {
            if lines.is_empty() {
                continue;
            }
            let delivery = self.delivery.clone();

            tasks.spawn(async move {
                let result = delivery.push(&lines).await;
                (project_id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(summary))) => {
                    report.lines_ok += summary.lines_ok;
                    report.lines_invalid += summary.lines_invalid;
                    report.lines_dropped += summary.lines_dropped;
                }
                Ok((project_id, Err(e))) => error!(project = %project_id, "Pushing lines of {project_id} failed: {e}"),
                Err(e) => error!("Push task failed: {e}"),
            }
        }
    }
}
