//! # Collector
//!
//! Self monitoring accumulator shared by every task of a polling cycle
//!
//! Counts are kept in [metrics] handles backed by atomics, so concurrent tasks never lose an
//! update. The collector is also a [metrics::Recorder], which lets callers record their own
//! metrics into the same report with [metrics::with_local_recorder].

use super::mint::{self, DimensionValue, IngestLine, MintType, MintValue, Summary};
use metrics::{Key, Label, Recorder, SharedString};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::error;

pub const REQUESTS: &str = "gcp.self_monitoring.requests";
pub const LINES_OK: &str = "gcp.self_monitoring.ingest.lines_ok";
pub const LINES_INVALID: &str = "gcp.self_monitoring.ingest.lines_invalid";
pub const LINES_DROPPED: &str = "gcp.self_monitoring.ingest.lines_dropped";
pub const NAME_TRUNCATIONS: &str = "gcp.self_monitoring.dimension_name_truncations";
pub const VALUE_TRUNCATIONS: &str = "gcp.self_monitoring.dimension_value_truncations";
pub const FETCH_FAILURES: &str = "gcp.self_monitoring.fetch_failures";
pub const CONNECTIVITY: &str = "gcp.self_monitoring.connectivity";
pub const PHASE_DURATION: &str = "gcp.self_monitoring.phase_duration";

/// Request counter api label for the Cloud Monitoring API
pub const API_MONITORING: &str = "monitoring";
/// Request counter api label for the ingest API
pub const API_INGEST: &str = "ingest";

/// Histogram handle appending to a shared buffer until the next flush
struct HistogramHandle {
    values: Arc<Mutex<Vec<f64>>>,
}

impl metrics::HistogramFn for HistogramHandle {
    fn record(&self, value: f64) {
        lock(&self.values).push(value);
    }
}

// Metric information stored in an index
enum MetricInfo {
    Counter(Arc<AtomicU64>),
    Gauge(Arc<AtomicU64>),
    Histogram(Arc<Mutex<Vec<f64>>>),
}

/// Tree of labels to name to metric details
#[derive(Default)]
struct CollectorState {
    info_tree: BTreeMap<Vec<Label>, BTreeMap<Key, MetricInfo>>,
}

/// Point in time copy of the counters of the current cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelfMonitoringCounters {
    /// Requests by api (`monitoring`, `ingest`) and HTTP status
    pub requests: BTreeMap<(String, u16), u64>,
    pub lines_ok: u64,
    pub lines_invalid: u64,
    pub lines_dropped: u64,
    pub dimension_name_truncations: u64,
    pub dimension_value_truncations: u64,
    pub fetch_failures: u64,
    /// Recorded durations in seconds by phase
    pub phase_durations: BTreeMap<String, Vec<f64>>,
}

impl SelfMonitoringCounters {
    /// Requests of one api summed over all statuses
    pub fn requests_for(&self, api: &str) -> u64 {
        self.requests
            .iter()
            .filter(|((name, _), _)| name == api)
            .map(|(_, count)| count)
            .sum()
    }
}

/// Self monitoring accumulator
///
/// # Example
/// ```
/// let monitoring = metrics_gcp_mint::SelfMonitoring::new();
/// monitoring.record_request("ingest", 200);
/// monitoring.add_lines_ok(10);
///
/// assert_eq!(monitoring.snapshot().lines_ok, 10);
/// monitoring.flush(std::io::stdout(), 1687657545423).unwrap();
/// ```
pub struct SelfMonitoring {
    state: Mutex<CollectorState>,
    lines_ok: metrics::Counter,
    lines_invalid: metrics::Counter,
    lines_dropped: metrics::Counter,
    name_truncations: metrics::Counter,
    value_truncations: metrics::Counter,
    fetch_failures: metrics::Counter,
}

impl Default for SelfMonitoring {
    fn default() -> Self {
        Self::new()
    }
}

impl SelfMonitoring {
    pub fn new() -> Self {
        let state = Mutex::new(CollectorState::default());
        let counter = |name: &'static str| {
            let value = Arc::new(AtomicU64::new(0));
            let mut state = lock(&state);
            state
                .info_tree
                .entry(Vec::new())
                .or_default()
                .insert(Key::from_static_name(name), MetricInfo::Counter(value.clone()));
            metrics::Counter::from_arc(value)
        };

        let lines_ok = counter(LINES_OK);
        let lines_invalid = counter(LINES_INVALID);
        let lines_dropped = counter(LINES_DROPPED);
        let name_truncations = counter(NAME_TRUNCATIONS);
        let value_truncations = counter(VALUE_TRUNCATIONS);
        let fetch_failures = counter(FETCH_FAILURES);

        Self {
            state,
            lines_ok,
            lines_invalid,
            lines_dropped,
            name_truncations,
            value_truncations,
            fetch_failures,
        }
    }

    pub fn record_request(&self, api: &'static str, status: u16) {
        let key = Key::from_parts(
            REQUESTS,
            vec![Label::new("api", api), Label::new("status", status.to_string())],
        );
        self.register_counter(&key, &metadata()).increment(1);
    }

    pub fn add_lines_ok(&self, lines: u64) {
        self.lines_ok.increment(lines);
    }

    pub fn add_lines_invalid(&self, lines: u64) {
        self.lines_invalid.increment(lines);
    }

    pub fn add_lines_dropped(&self, lines: u64) {
        self.lines_dropped.increment(lines);
    }

    pub fn record_name_truncation(&self) {
        self.name_truncations.increment(1);
    }

    pub fn record_value_truncation(&self) {
        self.value_truncations.increment(1);
    }

    pub fn record_fetch_failure(&self) {
        self.fetch_failures.increment(1);
    }

    pub fn record_phase(&self, phase: &'static str, elapsed: Duration) {
        let key = Key::from_parts(PHASE_DURATION, vec![Label::new("phase", phase)]);
        self.register_histogram(&key, &metadata()).record(elapsed.as_secs_f64());
    }

    /// Connectivity of the ingest endpoint, 0 when reachable
    pub fn set_connectivity(&self, code: u8) {
        let key = Key::from_static_name(CONNECTIVITY);
        self.register_gauge(&key, &metadata()).set(f64::from(code));
    }

    /// Copy the current values without resetting them
    pub fn snapshot(&self) -> SelfMonitoringCounters {
        let mut counters = SelfMonitoringCounters::default();
        let state = lock(&self.state);

        for (labels, metrics) in &state.info_tree {
            let label = |name: &str| labels.iter().find(|l| l.key() == name).map(|l| l.value().to_string());

            for (key, info) in metrics {
                match info {
                    MetricInfo::Counter(value) => {
                        let value = value.load(Ordering::Relaxed);
                        match key.name() {
                            REQUESTS => {
                                let api = label("api").unwrap_or_default();
                                let status = label("status").and_then(|s| s.parse().ok()).unwrap_or_default();
                                *counters.requests.entry((api, status)).or_default() += value;
                            }
                            LINES_OK => counters.lines_ok += value,
                            LINES_INVALID => counters.lines_invalid += value,
                            LINES_DROPPED => counters.lines_dropped += value,
                            NAME_TRUNCATIONS => counters.dimension_name_truncations += value,
                            VALUE_TRUNCATIONS => counters.dimension_value_truncations += value,
                            FETCH_FAILURES => counters.fetch_failures += value,
                            _ => {}
                        }
                    }
                    MetricInfo::Histogram(values) if key.name() == PHASE_DURATION => {
                        let phase = label("phase").unwrap_or_default();
                        counters
                            .phase_durations
                            .entry(phase)
                            .or_default()
                            .extend(lock(values).iter().copied());
                    }
                    MetricInfo::Histogram(_) | MetricInfo::Gauge(_) => {}
                }
            }
        }

        counters
    }

    /// Zero every counter and drop recorded durations, called at the start of a cycle
    pub fn reset(&self) {
        let state = lock(&self.state);
        for metrics in state.info_tree.values() {
            for info in metrics.values() {
                match info {
                    MetricInfo::Counter(value) => value.store(0, Ordering::Relaxed),
                    MetricInfo::Gauge(_) => {}
                    MetricInfo::Histogram(values) => lock(values).clear(),
                }
            }
        }
    }

    /// Render the accumulated values as MINT lines and reset them
    pub fn drain_lines(&self, timestamp: i64) -> Vec<IngestLine> {
        let mut lines = Vec::new();
        let state = lock(&self.state);

        for (labels, metrics) in &state.info_tree {
            let dimensions: Vec<DimensionValue> = labels
                .iter()
                .map(|label| DimensionValue::new(label.key(), label.value()))
                .collect();

            for (key, info) in metrics {
                let (metric_type, value) = match info {
                    MetricInfo::Counter(counter) => {
                        let value = counter.swap(0, Ordering::Relaxed);

                        // Omit this metric if there is no delta since last flushed
                        if value == 0 {
                            continue;
                        }
                        (MintType::Count, MintValue::Scalar(value as f64))
                    }
                    MetricInfo::Gauge(gauge) => (
                        MintType::Gauge,
                        MintValue::Scalar(f64::from_bits(gauge.load(Ordering::Relaxed))),
                    ),
                    MetricInfo::Histogram(histogram) => {
                        let values: Vec<f64> = std::mem::take(&mut *lock(histogram));

                        // Omit this metric if there is no new values since last flushed
                        if values.is_empty() {
                            continue;
                        }
                        let summary = Summary {
                            min: values.iter().copied().fold(f64::INFINITY, f64::min),
                            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                            count: values.len() as i64,
                            sum: values.iter().sum(),
                        };
                        (MintType::Gauge, MintValue::Summary(summary))
                    }
                };

                lines.push(IngestLine {
                    entity_id: String::new(),
                    metric_name: key.name().to_string(),
                    metric_type,
                    value,
                    timestamp,
                    dimensions: dimensions.clone(),
                });
            }
        }

        lines
    }

    /// Flush the accumulated values as MINT lines to an implementation of std::io::Write
    pub fn flush(&self, writer: impl std::io::Write, timestamp: i64) -> std::io::Result<()> {
        mint::write_lines(writer, &self.drain_lines(timestamp))
    }
}

fn metadata() -> metrics::Metadata<'static> {
    metrics::Metadata::new(module_path!(), metrics::Level::INFO, Some(module_path!()))
}

/// The state only holds atomics and buffers, a panic while holding the lock leaves it usable
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Recorder for SelfMonitoring {
    fn describe_counter(&self, _key: metrics::KeyName, _unit: Option<metrics::Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: metrics::KeyName, _unit: Option<metrics::Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: metrics::KeyName, _unit: Option<metrics::Unit>, _description: SharedString) {}

    #[allow(clippy::mutable_key_type)] // metrics::Key has interior mutability
    fn register_counter(&self, key: &Key, _metadata: &metrics::Metadata) -> metrics::Counter {
        // Build our own copy of the labels before aquiring the mutex
        let labels: Vec<Label> = key.labels().cloned().collect();
        let mut state = lock(&self.state);
        let label_info = state.info_tree.entry(labels).or_default();

        match label_info.get(key) {
            Some(MetricInfo::Counter(value)) => metrics::Counter::from_arc(value.clone()),
            Some(_) => {
                error!("Unable to register counter {key} as it was already registered as another type");
                metrics::Counter::noop()
            }
            None => {
                let value = Arc::new(AtomicU64::new(0));
                label_info.insert(key.clone(), MetricInfo::Counter(value.clone()));
                metrics::Counter::from_arc(value)
            }
        }
    }

    #[allow(clippy::mutable_key_type)] // metrics::Key has interior mutability
    fn register_gauge(&self, key: &Key, _metadata: &metrics::Metadata) -> metrics::Gauge {
        let labels: Vec<Label> = key.labels().cloned().collect();
        let mut state = lock(&self.state);
        let label_info = state.info_tree.entry(labels).or_default();

        match label_info.get(key) {
            Some(MetricInfo::Gauge(value)) => metrics::Gauge::from_arc(value.clone()),
            Some(_) => {
                error!("Unable to register gauge {key} as it was already registered as another type");
                metrics::Gauge::noop()
            }
            None => {
                let value = Arc::new(AtomicU64::new(0));
                label_info.insert(key.clone(), MetricInfo::Gauge(value.clone()));
                metrics::Gauge::from_arc(value)
            }
        }
    }

    #[allow(clippy::mutable_key_type)] // metrics::Key has interior mutability
    fn register_histogram(&self, key: &Key, _metadata: &metrics::Metadata) -> metrics::Histogram {
        let labels: Vec<Label> = key.labels().cloned().collect();
        let mut state = lock(&self.state);
        let label_info = state.info_tree.entry(labels).or_default();

        match label_info.get(key) {
            Some(MetricInfo::Histogram(values)) => {
                metrics::Histogram::from_arc(Arc::new(HistogramHandle { values: values.clone() }))
            }
            Some(_) => {
                error!("Unable to register histogram {key} as it was already registered as another type");
                metrics::Histogram::noop()
            }
            None => {
                let values = Arc::new(Mutex::new(Vec::new()));
                label_info.insert(key.clone(), MetricInfo::Histogram(values.clone()));
                metrics::Histogram::from_arc(Arc::new(HistogramHandle { values }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_requests_by_api_and_status() {
        let monitoring = SelfMonitoring::new();
        monitoring.record_request(API_INGEST, 200);
        monitoring.record_request(API_INGEST, 200);
        monitoring.record_request(API_INGEST, 429);
        monitoring.record_request(API_MONITORING, 200);

        let counters = monitoring.snapshot();
        assert_eq!(counters.requests[&(API_INGEST.to_string(), 200)], 2);
        assert_eq!(counters.requests[&(API_INGEST.to_string(), 429)], 1);
        assert_eq!(counters.requests_for(API_INGEST), 3);
        assert_eq!(counters.requests_for(API_MONITORING), 1);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let monitoring = Arc::new(SelfMonitoring::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let monitoring = monitoring.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        monitoring.add_lines_ok(1);
                        monitoring.record_request(API_MONITORING, 200);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let counters = monitoring.snapshot();
        assert_eq!(counters.lines_ok, 8000);
        assert_eq!(counters.requests_for(API_MONITORING), 8000);
    }

    #[test]
    fn reset_clears_the_cycle() {
        let monitoring = SelfMonitoring::new();
        monitoring.add_lines_dropped(5);
        monitoring.record_phase("fetch", Duration::from_millis(1500));
        assert_eq!(monitoring.snapshot().phase_durations["fetch"], vec![1.5]);

        monitoring.reset();
        let counters = monitoring.snapshot();
        assert_eq!(counters.lines_dropped, 0);
        assert!(counters.phase_durations["fetch"].is_empty());
    }

    #[test]
    fn local_recorder_records_into_the_report() {
        let monitoring = SelfMonitoring::new();
        metrics::with_local_recorder(&monitoring, || {
            metrics::counter!(REQUESTS, "api" => "monitoring", "status" => "503").increment(2);
        });
        assert_eq!(monitoring.snapshot().requests[&(API_MONITORING.to_string(), 503)], 2);
    }

    #[test]
    fn flush_writes_mint_lines() {
        let monitoring = SelfMonitoring::new();
        monitoring.add_lines_ok(7);
        monitoring.record_request(API_INGEST, 200);
        monitoring.set_connectivity(0);
        monitoring.record_phase("push", Duration::from_secs(2));
        monitoring.record_phase("push", Duration::from_secs(4));

        let mut output = Vec::new();
        monitoring.flush(&mut output, 1687657545423).unwrap();
        let output_str = std::str::from_utf8(&output).unwrap();
        assert_eq!(
            output_str,
            r#"gcp.self_monitoring.connectivity gauge,0 1687657545423
gcp.self_monitoring.ingest.lines_ok count,delta=7 1687657545423
gcp.self_monitoring.requests,api="ingest",status="200" count,delta=1 1687657545423
gcp.self_monitoring.phase_duration,phase="push" gauge,min=2,max=4,count=2,sum=6 1687657545423
"#
        );

        // counters were drained by the flush
        assert_eq!(monitoring.snapshot().lines_ok, 0);
    }
}
