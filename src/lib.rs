//! # metrics_gcp_mint
//!
//! Polls Google Cloud Monitoring time series, converts the samples into MINT metric lines and
//! delivers them to an ingest endpoint, keeping count of its own health along the way.
//!
//! # Example
//! ```no_run
//! # use metrics_gcp_mint::{Error, ServiceDefinition};
//! # async fn run(services: Vec<std::sync::Arc<ServiceDefinition>>) -> Result<(), Error> {
//! let orchestrator = metrics_gcp_mint::Builder::new()
//!     .ingest_url("https://tenant.example.com")
//!     .api_token("dt0c01.TOKEN")
//!     .init(String::from("ya29.ACCESS_TOKEN"), Default::default())?;
//!
//! let projects = [metrics_gcp_mint::Project::new("my-project")];
//! let report = orchestrator.run_cycle(&projects, &services, chrono::Utc::now()).await;
//! tracing::info!("pushed {} lines", report.lines_ok);
//! # Ok(())
//! # }
//! ```

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

pub use {
    builder::{Builder, Config},
    collector::{SelfMonitoring, SelfMonitoringCounters},
    delivery::{ConnectivityState, DeliveryClient, DeliveryError, IngestApi, PushSummary},
    entity::{Entity, EntityExtractor, ExtractorRegistry},
    fetcher::{FetchError, MetricQuery, MonitoringApi, TimeSeriesFetcher},
    http::{ApiResponse, HttpError, TokenProvider},
    mint::{DimensionValue, IngestLine, MintType, MintValue},
    model::{Dimension, MetricDefinition, MetricExclusion, MetricKind, ServiceDefinition, ValueType},
    orchestrator::{CycleReport, Orchestrator, Project},
    pacer::DeliveryPacer,
};

pub mod aggregation;
mod builder;
mod collector;
pub mod delivery;
pub mod dimensions;
pub mod distribution;
pub mod entity;
pub mod fetcher;
pub mod http;
pub mod lines;
pub mod mint;
pub mod model;
mod orchestrator;
mod pacer;
pub mod timeseries;
