//! # Distribution
//!
//! Value extraction for points, including the min/max/count/sum approximation of
//! histogram encoded distribution values.
//!
//! Only the bucket boundaries are known for a distribution, so `min` and `max` are bounded by
//! the first and last populated bucket. When a bound cannot be read from the encoding they stay
//! at 0, which is an accepted approximation rather than a measured value.

use super::mint::{MintValue, Summary};
use super::model::MetricDefinition;
use super::timeseries::{BucketOptions, Distribution, TypedValue};
use tracing::debug;

/// Extract the value of a point, `None` when the point carries nothing to deliver
pub fn extract(value: &TypedValue, metric: &MetricDefinition) -> Option<MintValue> {
    let scale = if metric.is_hundredths_of_percent() { 100.0 } else { 1.0 };

    if let Some(distribution) = &value.distribution_value {
        let summary = summarize(distribution)?;
        return Some(MintValue::Summary(Summary {
            min: summary.min * scale,
            max: summary.max * scale,
            count: summary.count,
            sum: summary.sum * scale,
        }));
    }

    let scalar = if let Some(v) = value.double_value {
        v
    } else if let Some(v) = value.int64_value {
        v.0 as f64
    } else if let Some(v) = value.bool_value {
        if v {
            1.0
        } else {
            0.0
        }
    } else {
        debug!("Skipping point of {} without a supported value", metric.source_name());
        return None;
    };

    let scalar = scalar * scale;
    if !scalar.is_finite() {
        debug!("Skipping non-finite value of {}", metric.source_name());
        return None;
    }
    Some(MintValue::Scalar(scalar))
}

/// Approximate a distribution, `None` for an empty one
pub fn summarize(distribution: &Distribution) -> Option<Summary> {
    let count = distribution.count.0;
    if count <= 0 {
        return None;
    }

    let mean = distribution.mean.unwrap_or(0.0);
    let sum = mean * count as f64;

    // Too few samples to bound a range
    if count < 3 {
        return Some(Summary {
            min: mean,
            max: mean,
            count,
            sum,
        });
    }

    let counts = &distribution.bucket_counts;
    let mut summary = Summary {
        min: 0.0,
        max: 0.0,
        count,
        sum,
    };

    let Some(min_bucket) = counts.iter().position(|c| c.0 > 0) else {
        return Some(summary);
    };
    let max_bucket = counts
        .iter()
        .rposition(|c| c.0 > 0)
        .unwrap_or(min_bucket)
        .min(counts.len() - 1);

    if let Some(options) = &distribution.bucket_options {
        if let Some(min) = bucket_bound(options, min_bucket) {
            summary.min = min;
        }
        if let Some(max) = bucket_bound(options, max_bucket) {
            summary.max = max;
        }
    }

    Some(summary)
}

/// Boundary of a finite bucket, bucket 0 is the underflow and `num_finite_buckets + 1` the
/// overflow bucket which have no usable boundary
fn bucket_bound(options: &BucketOptions, index: usize) -> Option<f64> {
    if index == 0 {
        return None;
    }

    if let Some(exponential) = &options.exponential_buckets {
        let finite = usize::try_from(exponential.num_finite_buckets).ok()?;
        if index > finite {
            return None;
        }
        let exponent = i32::try_from(index - 1).ok()?;
        return Some(exponential.scale * exponential.growth_factor.powi(exponent));
    }

    if let Some(linear) = &options.linear_buckets {
        let finite = usize::try_from(linear.num_finite_buckets).ok()?;
        if index > finite {
            return None;
        }
        return Some(linear.offset + linear.width * (index - 1) as f64);
    }

    if let Some(explicit) = &options.explicit_buckets {
        // N bounds describe N - 1 finite buckets
        if explicit.bounds.len() < 2 || index >= explicit.bounds.len() {
            return None;
        }
        return Some(explicit.bounds[index]);
    }

    None
}
