#![allow(non_snake_case)]
use metrics_gcp_mint::{Error, ExtractorRegistry, Project, ServiceDefinition};
use std::sync::Arc;
use tracing::info;

/// Runs one polling cycle
///
/// `PollerDemo services.json` with `INGEST_URL`, `INGEST_API_TOKEN`, `GCP_ACCESS_TOKEN` and the
/// comma separated `GCP_PROJECTS` set in the environment
#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .with_target(false)
        .without_time()
        .compact()
        .init();

    let path = std::env::args().nth(1).ok_or("usage: PollerDemo <services.json>")?;
    let services: Vec<ServiceDefinition> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    let services: Vec<Arc<ServiceDefinition>> = services.into_iter().map(Arc::new).collect();

    let projects: Vec<Project> = std::env::var("GCP_PROJECTS")?
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(Project::new)
        .collect();

    let orchestrator =
        metrics_gcp_mint::Builder::from_env()?.init(std::env::var("GCP_ACCESS_TOKEN")?, ExtractorRegistry::new())?;

    let report = orchestrator.run_cycle(&projects, &services, chrono::Utc::now()).await;
    info!(
        "{} lines built, {} ok, {} invalid, {} dropped",
        report.lines_built, report.lines_ok, report.lines_invalid, report.lines_dropped
    );

    orchestrator
        .monitoring()
        .flush(std::io::stdout(), chrono::Utc::now().timestamp_millis())?;
    Ok(())
}
