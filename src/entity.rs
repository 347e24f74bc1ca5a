//! # Entity
//!
//! Correlation of lines with topology entities, and the registry of entity extractors
//!
//! Lines and entities meet on a deterministic id derived from the service name and the
//! resource labels of a series, so extractors can compute the same id from their own data.

use super::dimensions::DimensionSanitizer;
use super::mint::IngestLine;
use super::model::ServiceDefinition;
use super::Error;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error};
use xxhash_rust::xxh3::xxh3_64;

const RESOURCE_LABEL_PREFIX: &str = "resource.labels.";

/// A monitored resource instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entity {
    pub id: String,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

/// Hash of the service name and the resource label values
///
/// Values are taken in the order of the service's `resource.labels.*` dimensions, a service
/// without any uses every resource label ordered by key. Missing labels are skipped.
pub fn entity_id(service: &ServiceDefinition, resource_labels: &BTreeMap<String, String>) -> String {
    let configured: Vec<&str> = service
        .dimensions()
        .iter()
        .filter_map(|d| d.source().strip_prefix(RESOURCE_LABEL_PREFIX))
        .filter_map(|label| resource_labels.get(label))
        .map(String::as_str)
        .collect();

    let values = if configured.is_empty() {
        resource_labels.values().map(String::as_str).collect()
    } else {
        configured
    };

    let mut key = String::from(service.name());
    for value in values {
        // unit separator, cannot appear in label values
        key.push('\u{1f}');
        key.push_str(value);
    }
    format!("{:016X}", xxh3_64(key.as_bytes()))
}

/// Append entity dimensions to every line correlated with a known entity
pub fn enrich(lines: &mut [IngestLine], entities: &HashMap<String, Entity>, sanitizer: &DimensionSanitizer) {
    if entities.is_empty() {
        return;
    }

    for line in lines.iter_mut() {
        let Some(entity) = entities.get(&line.entity_id) else {
            continue;
        };

        let dns_name = entity.dns_names.first().map(|name| ("entity.dns_name".to_string(), name));
        let ip_address = entity.ip_addresses.first().map(|ip| ("entity.ip_address".to_string(), ip));
        let properties = entity
            .properties
            .iter()
            .map(|(key, value)| (format!("entity.{}", property_name(key)), value));

        for (name, value) in dns_name.into_iter().chain(ip_address).chain(properties) {
            if let Some(dimension) = sanitizer.dimension(&name, value) {
                line.dimensions.push(dimension);
            }
        }
    }
}

/// `Machine Type` → `machine_type`
fn property_name(key: &str) -> String {
    key.to_lowercase().replace([' ', '-'], "_")
}

/// Discovers the entities of one service in one project
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, project_id: &str, service: &ServiceDefinition) -> Result<Vec<Entity>, Error>;
}

/// Entity extractors by service name
///
/// # Example
/// ```
/// use metrics_gcp_mint::{Entity, EntityExtractor, ExtractorRegistry, ServiceDefinition};
///
/// struct Instances;
///
/// #[async_trait::async_trait]
/// impl EntityExtractor for Instances {
///     async fn extract(
///         &self,
///         _project_id: &str,
///         _service: &ServiceDefinition,
///     ) -> Result<Vec<Entity>, metrics_gcp_mint::Error> {
///         Ok(Vec::new())
///     }
/// }
///
/// let registry = ExtractorRegistry::new().register("gce_instance", Instances);
/// assert!(registry.get("gce_instance").is_some());
/// ```
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<String, Arc<dyn EntityExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the extractor of a service, replacing any previous one
    pub fn register(mut self, service: impl Into<String>, extractor: impl EntityExtractor + 'static) -> Self {
        self.extractors.insert(service.into(), Arc::new(extractor));
        self
    }

    pub fn get(&self, service: &str) -> Option<&Arc<dyn EntityExtractor>> {
        self.extractors.get(service)
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }

    /// Run the extractors of the given services concurrently and index the entities by id
    ///
    /// A failing extractor is logged and contributes nothing.
    pub async fn entities(&self, project_id: &str, services: &[Arc<ServiceDefinition>]) -> HashMap<String, Entity> {
        let extractions = services.iter().filter_map(|service| {
            let extractor = self.get(service.name())?.clone();
            Some(async move { (service.name(), extractor.extract(project_id, service).await) })
        });

        let mut entities = HashMap::new();
        for (service, result) in join_all(extractions).await {
            match result {
                Ok(found) => {
                    debug!("Extracted {} {service} entities in {project_id}", found.len());
                    entities.extend(found.into_iter().map(|entity| (entity.id.clone(), entity)));
                }
                Err(e) => error!("Entity extraction for {service} in {project_id} failed: {e}"),
            }
        }
        entities
    }
}
