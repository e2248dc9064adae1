//! In-memory histogram of cycle durations for /stats/latency.

use std::sync::Mutex;
use std::time::Duration;

use hdrhistogram::Histogram;

use crate::error::{AppError, Result};

/// Shared cycle latency stats. Engine records, API reads.
/// Values stored in milliseconds.
pub struct LatencyStats {
    inner: Mutex<Histogram<u64>>,
}

impl LatencyStats {
    /// Tracks 1ms to 1h, 3 significant figures.
    pub fn new() -> Result<Self> {
        let histogram = Histogram::new_with_bounds(1, 3_600_000, 3)
            .map_err(|e| AppError::Config(format!("latency histogram: {e}")))?;
        Ok(Self {
            inner: Mutex::new(histogram),
        })
    }

    pub fn record(&self, d: Duration) {
        let ms = d.as_millis().clamp(1, 3_600_000) as u64;
        if let Ok(mut h) = self.inner.lock() {
            let _ = h.record(ms);
        }
    }

    /// Return (p50_ms, p95_ms, p99_ms). None if no samples.
    pub fn percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        let Ok(h) = self.inner.lock() else {
            return (None, None, None);
        };
        if h.len() == 0 {
            return (None, None, None);
        }
        (
            Some(h.value_at_quantile(0.5)),
            Some(h.value_at_quantile(0.95)),
            Some(h.value_at_quantile(0.99)),
        )
    }

    /// Sample count.
    pub fn len(&self) -> u64 {
        self.inner.lock().map(|h| h.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_has_no_percentiles() {
        let stats = LatencyStats::new().unwrap();
        assert_eq!(stats.percentiles(), (None, None, None));
    }

    #[test]
    fn records_cycle_durations() {
        let stats = LatencyStats::new().unwrap();
        for ms in [100u64, 200, 300, 400, 5_000] {
            stats.record(Duration::from_millis(ms));
        }
        assert_eq!(stats.len(), 5);
        let (p50, _, p99) = stats.percentiles();
        assert!((299..=301).contains(&p50.unwrap()));
        assert!(p99.unwrap() >= 4_990);
        // sub-millisecond cycles still count
        stats.record(Duration::from_micros(10));
        assert_eq!(stats.len(), 6);
    }
}
