//! # Dimensions
//!
//! Mapping of Cloud Monitoring label paths to dimension names, and the sanitizing every
//! dimension goes through before it is placed on a line.

use super::collector::SelfMonitoring;
use super::mint::DimensionValue;
use super::model::Dimension;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Maps a source label path (`metric.labels.zone`, `metadata.systemLabels.name`, ...) to the
/// dimension names it is delivered under. One source can fan out to several names, e.g. a
/// legacy and a current name for the same label.
#[derive(Debug, Clone, Default)]
pub struct DimensionMapper {
    mapping: BTreeMap<String, BTreeSet<String>>,
}

impl DimensionMapper {
    pub fn new<'a>(dimensions: impl IntoIterator<Item = &'a Dimension>) -> Self {
        let mut mapping: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for dimension in dimensions {
            mapping
                .entry(dimension.source().to_string())
                .or_default()
                .insert(dimension.target().to_string());
        }
        Self { mapping }
    }

    /// Configured names for `source`, or `fallback` alone so that labels returned without being
    /// configured are still surfaced instead of silently dropped
    pub fn get<'a>(&'a self, source: &str, fallback: &'a str) -> Vec<&'a str> {
        match self.mapping.get(source) {
            Some(targets) => targets.iter().map(String::as_str).collect(),
            None => vec![fallback],
        }
    }
}

/// Length limits MINT places on dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionLimits {
    pub max_name_length: usize,
    pub max_value_length: usize,
}

impl Default for DimensionLimits {
    fn default() -> Self {
        Self {
            max_name_length: 100,
            max_value_length: 250,
        }
    }
}

/// Builds sanitized, length capped dimension values and counts every truncation
pub struct DimensionSanitizer {
    limits: DimensionLimits,
    monitoring: Arc<SelfMonitoring>,
}

impl DimensionSanitizer {
    pub fn new(limits: DimensionLimits, monitoring: Arc<SelfMonitoring>) -> Self {
        Self { limits, monitoring }
    }

    /// `None` when the value is empty, which MINT rejects
    pub fn dimension(&self, name: &str, value: &str) -> Option<DimensionValue> {
        let mut value = escape(value);
        if value.is_empty() {
            return None;
        }

        let mut name = name.to_string();
        if truncate_name(&mut name, self.limits.max_name_length) {
            debug!("Dimension name longer than {} characters truncated to {name}", self.limits.max_name_length);
            self.monitoring.record_name_truncation();
        }
        if truncate_value(&mut value, self.limits.max_value_length) {
            debug!(
                "Value of dimension {name} longer than {} characters truncated",
                self.limits.max_value_length
            );
            self.monitoring.record_value_truncation();
        }

        if value.is_empty() {
            return None;
        }
        Some(DimensionValue::new(name, value))
    }
}

/// Collapse control whitespace to spaces and escape backslashes and quotes
pub fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\r' | '\n' | '\t' => escaped.push(' '),
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Truncate to exactly `limit` characters, returns whether anything was cut
pub fn truncate_name(name: &mut String, limit: usize) -> bool {
    match name.char_indices().nth(limit) {
        Some((end, _)) => {
            name.truncate(end);
            true
        }
        None => false,
    }
}

/// Truncate an escaped value to at most `limit` characters without leaving half of an escape
/// sequence behind: an odd number of trailing backslashes loses one more character.
pub fn truncate_value(value: &mut String, limit: usize) -> bool {
    if !truncate_name(value, limit) {
        return false;
    }

    let trailing = value.chars().rev().take_while(|c| *c == '\\').count();
    if trailing % 2 == 1 {
        value.pop();
    }
    true
}
