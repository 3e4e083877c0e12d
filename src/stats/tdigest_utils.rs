//! TDigest helpers for latency percentiles.
//!
//! Percentiles are estimated over the retained history window only; the
//! running extrema and mean in [`super::TargetStats`] cover every sample.

use tdigests::TDigest;

/// Latency percentiles over a set of samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
}

/// Estimate p50/p95, or `None` when there are no samples.
///
/// Estimates are clamped into the observed range so a sparse digest cannot
/// report a value outside `[min, max]`.
pub fn estimate_percentiles(values: &[f64]) -> Option<Percentiles> {
    if values.is_empty() {
        return None;
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let td = TDigest::from_values(values.to_vec());
    let quantile = |q: f64| {
        let estimate = td.estimate_quantile(q);
        if estimate.is_nan() {
            min
        } else {
            estimate.clamp(min, max)
        }
    };

    Some(Percentiles {
        p50: quantile(0.5),
        p95: quantile(0.95),
    })
}
