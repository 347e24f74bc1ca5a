//! # Aggregation
//!
//! Choice of the per series aligner and cross series reducer sent with every query
//!
//! <https://cloud.google.com/monitoring/api/ref_v3/rest/v3/projects.alertPolicies#Aggregation>

use super::model::{MetricKind, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aligner {
    CountTrue,
    Delta,
    Mean,
    Sum,
}

impl Aligner {
    pub fn as_str(self) -> &'static str {
        match self {
            Aligner::CountTrue => "ALIGN_COUNT_TRUE",
            Aligner::Delta => "ALIGN_DELTA",
            Aligner::Mean => "ALIGN_MEAN",
            Aligner::Sum => "ALIGN_SUM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reducer {
    None,
    Mean,
    Sum,
}

impl Reducer {
    pub fn as_str(self) -> &'static str {
        match self {
            Reducer::None => "REDUCE_NONE",
            Reducer::Mean => "REDUCE_MEAN",
            Reducer::Sum => "REDUCE_SUM",
        }
    }
}

/// Select the aligner and reducer for a metric kind and value type
pub fn select(kind: MetricKind, value_type: ValueType) -> (Aligner, Reducer) {
    match (kind, value_type) {
        (_, ValueType::Bool) => (Aligner::CountTrue, Reducer::Sum),
        (MetricKind::Cumulative, _) => (Aligner::Delta, Reducer::None),
        (MetricKind::Gauge, ValueType::Int64 | ValueType::Double) => (Aligner::Mean, Reducer::Mean),
        _ => (Aligner::Sum, Reducer::Sum),
    }
}
