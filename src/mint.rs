//! # MINT
//!
//! Helpers for rendering metric ingest lines
//!
//! `name[,dimension="value"...] <type>(,|=)<value> <timestamp-ms>`

use std::fmt;

/// MINT metric type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MintType {
    Gauge,
    Count,
}

impl MintType {
    /// Type token and the separator placed between it and the value
    fn token(self) -> (&'static str, char) {
        match self {
            MintType::Gauge => ("gauge", ','),
            MintType::Count => ("count,delta", '='),
        }
    }
}

/// Summary of a distribution, the only part of a histogram MINT can carry
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Summary {
    pub min: f64,
    pub max: f64,
    pub count: i64,
    pub sum: f64,
}

/// Value of a single MINT line
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MintValue {
    Scalar(f64),
    Summary(Summary),
}

impl fmt::Display for MintValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MintValue::Scalar(value) => write!(f, "{value}"),
            MintValue::Summary(s) => write!(f, "min={},max={},count={},sum={}", s.min, s.max, s.count, s.sum),
        }
    }
}

/// A dimension name and its already sanitized value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionValue {
    pub name: String,
    pub value: String,
}

impl DimensionValue {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One MINT record
#[derive(Debug, Clone, PartialEq)]
pub struct IngestLine {
    /// Correlation id joining the line with topology, never rendered
    pub entity_id: String,
    pub metric_name: String,
    pub metric_type: MintType,
    pub value: MintValue,
    /// Milliseconds since the epoch
    pub timestamp: i64,
    pub dimensions: Vec<DimensionValue>,
}

impl fmt::Display for IngestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metric_name)?;

        // Empty values are invalid on the wire, the dimension is left out instead
        for dimension in self.dimensions.iter().filter(|d| !d.value.is_empty()) {
            write!(f, ",{}=\"{}\"", dimension.name, dimension.value)?;
        }

        let (token, separator) = self.metric_type.token();
        write!(f, " {token}{separator}{} {}", self.value, self.timestamp)
    }
}

/// Write lines to an implementation of [std::io::Write], one per row
pub fn write_lines<'a>(
    mut writer: impl std::io::Write,
    lines: impl IntoIterator<Item = &'a IngestLine>,
) -> std::io::Result<()> {
    for line in lines {
        writeln!(writer, "{line}")?;
    }
    Ok(())
}
