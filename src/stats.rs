//! Per-operation latency accounting
//!
//! HdrHistogram-backed latency tracking for the benchmark driver: constant
//! time recording, accurate mean and percentiles, no per-sample allocation.

use hdrhistogram::Histogram;
use std::time::Duration;

/// One hour, the histogram's upper bound in microseconds
const MAX_LATENCY_US: u64 = 3_600_000_000;

/// Latency histogram with microsecond resolution
#[derive(Debug)]
pub struct LatencyHistogram {
    histogram: Histogram<u64>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        let histogram = Histogram::new_with_bounds(1, MAX_LATENCY_US, 3)
            .expect("histogram bounds are statically valid");
        Self { histogram }
    }

    /// Record one operation latency, clamped to the tracked range
    #[inline]
    pub fn record(&mut self, latency: Duration) {
        let micros = (latency.as_micros() as u64).clamp(1, MAX_LATENCY_US);
        let _ = self.histogram.record(micros);
    }

    /// Number of recorded samples
    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    /// Mean latency in microseconds
    pub fn mean_us(&self) -> f64 {
        self.histogram.mean()
    }

    /// Maximum recorded latency in microseconds
    pub fn max_us(&self) -> u64 {
        self.histogram.max()
    }

    /// Latency at `percentile` (0.0 - 100.0) in microseconds
    pub fn percentile_us(&self, percentile: f64) -> u64 {
        self.histogram.value_at_percentile(percentile)
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}
