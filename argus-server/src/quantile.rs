//! Summary statistics over a sample window

use std::fmt;

/// Summary of a sample window.
///
/// Percentiles use the nearest-rank rule without interpolation: the value at
/// index `floor(n * p / 100)` of the sorted window, clamped to the last index.
/// This is coarser than the interpolated quantiles some monitoring systems
/// compute, and consumers of the exposed gauges rely on this exact rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "avg={:.3}s min={:.3}s max={:.3}s p50={:.3}s p95={:.3}s p99={:.3}s",
            self.avg, self.min, self.max, self.p50, self.p95, self.p99
        )
    }
}

/// Summarise `values`, or `None` when there is nothing to summarise.
///
/// The input is copied before sorting; the caller's slice is left as is.
pub fn summarize(values: &[f64]) -> Option<Summary> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let sum: f64 = sorted.iter().sum();
    let avg = sum / sorted.len() as f64;

    Some(Summary {
        avg,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        p50: nearest_rank(&sorted, 50),
        p95: nearest_rank(&sorted, 95),
        p99: nearest_rank(&sorted, 99),
    })
}

fn nearest_rank(sorted: &[f64], percent: usize) -> f64 {
    let index = (sorted.len() * percent / 100).min(sorted.len() - 1);
    sorted[index]
}
