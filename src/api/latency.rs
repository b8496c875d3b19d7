//! In-memory latency histograms for the poll cycle and the fusion read path.

use std::sync::Mutex;
use std::time::Duration;

use hdrhistogram::Histogram;
use serde::Serialize;

use crate::error::{AppError, Result};

/// One histogram, values in microseconds.
pub struct LatencyStats {
    inner: Mutex<Histogram<u64>>,
}

#[derive(Debug, Default, Serialize, PartialEq)]
pub struct Percentiles {
    pub samples: u64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
}

impl LatencyStats {
    /// Tracks 1us to 100s, 3 significant figures.
    pub fn new() -> Result<Self> {
        let histogram = Histogram::new_with_bounds(1, 100_000_000, 3)
            .map_err(|e| AppError::Config(format!("histogram bounds: {e}")))?;
        Ok(Self { inner: Mutex::new(histogram) })
    }

    pub fn record(&self, d: Duration) {
        let us = d.as_micros().min(u128::from(u64::MAX)) as u64;
        if let Ok(mut h) = self.inner.lock() {
            // Out-of-range samples are clamped rather than dropped.
            h.saturating_record(us.max(1));
        }
    }

    pub fn percentiles(&self) -> Percentiles {
        let Ok(h) = self.inner.lock() else {
            return Percentiles::default();
        };
        if h.is_empty() {
            return Percentiles::default();
        }
        let ms = |q: f64| Some(h.value_at_quantile(q) as f64 / 1000.0);
        Percentiles {
            samples: h.len(),
            p50_ms: ms(0.5),
            p95_ms: ms(0.95),
            p99_ms: ms(0.99),
        }
    }
}

/// Fusion and poll latency, shared between the poller, the API handlers and /stats/latency.
pub struct Latencies {
    pub fusion: LatencyStats,
    pub poll: LatencyStats,
}

impl Latencies {
    pub fn new() -> Result<Self> {
        Ok(Self { fusion: LatencyStats::new()?, poll: LatencyStats::new()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_has_no_percentiles() {
        let stats = LatencyStats::new().unwrap();
        assert_eq!(stats.percentiles(), Percentiles::default());
    }

    #[test]
    fn percentiles_are_reported_in_ms() {
        let stats = LatencyStats::new().unwrap();
        for ms in 1..=100 {
            stats.record(Duration::from_millis(ms));
        }
        let p = stats.percentiles();
        assert_eq!(p.samples, 100);
        let p50 = p.p50_ms.unwrap();
        assert!((49.0..=51.0).contains(&p50), "p50 {p50}");
        assert!(p.p99_ms.unwrap() >= p.p95_ms.unwrap());
    }
}
