use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

/// Rate series recording check successes (true outcomes / total).
pub const CHECKS: &str = "checks";

/// Rate series recording API failures (non-success status or transport error).
pub const API_FAILURES: &str = "api_failures";

/// Rate series recording transport-level failures only (connection errors,
/// timeouts); requests that reached the server count false regardless of
/// status.
pub const HTTP_REQ_FAILED: &str = "http_req_failed";

/// All rate series the harness writes. Thresholds with a `rate` predicate
/// must target one of these names.
pub const RATE_SERIES_NAMES: [&str; 3] = [CHECKS, API_FAILURES, HTTP_REQ_FAILED];

/// Boolean-outcome counters for one named rate series.
///
/// Both counters are monotonically increasing and written with relaxed
/// atomics; the fraction is only read after (or between) write bursts, and
/// all writes are commutative.
#[derive(Default)]
struct RateSeries {
    hits: AtomicU64,
    total: AtomicU64,
}

/// Concurrency-safe registry of named metric series.
///
/// Series are created lazily on first write. `DashMap` shards the map locks
/// so workers writing to different series never contend, and latency series
/// take a short per-series mutex only to push one sample.
pub struct Registry {
    rates: DashMap<String, RateSeries>,
    latencies: DashMap<String, Mutex<Vec<Duration>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            rates: DashMap::with_capacity(RATE_SERIES_NAMES.len()),
            latencies: DashMap::with_capacity(8),
        }
    }

    /// Record one boolean outcome into the named rate series.
    pub fn record_rate(&self, name: &str, outcome: bool) {
        let series = self.rates.entry(name.to_owned()).or_default();
        series.total.fetch_add(1, Ordering::Relaxed);
        if outcome {
            series.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Append one latency sample to the named latency series.
    pub fn record_latency(&self, name: &str, latency: Duration) {
        self.latencies
            .entry(name.to_owned())
            .or_default()
            .lock()
            .push(latency);
    }

    /// Fraction of true outcomes in the named rate series.
    ///
    /// Returns `None` if the series does not exist or has no observations.
    pub fn rate(&self, name: &str) -> Option<f64> {
        let series = self.rates.get(name)?;
        let total = series.total.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        let hits = series.hits.load(Ordering::Relaxed);
        Some(hits as f64 / total as f64)
    }

    /// Raw (hits, total) counters for the named rate series.
    pub fn rate_counts(&self, name: &str) -> Option<(u64, u64)> {
        let series = self.rates.get(name)?;
        Some((
            series.hits.load(Ordering::Relaxed),
            series.total.load(Ordering::Relaxed),
        ))
    }

    /// Nearest-rank percentile of the named latency series.
    ///
    /// `rank = ceil(pct/100 × count)`, 1-indexed over the sorted samples.
    /// Returns `None` if the series does not exist or is empty.
    pub fn percentile(&self, name: &str, pct: f64) -> Option<Duration> {
        let series = self.latencies.get(name)?;
        let mut samples = series.lock().clone();
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let rank = ((pct / 100.0) * samples.len() as f64).ceil() as usize;
        let idx = rank.clamp(1, samples.len()) - 1;
        Some(samples[idx])
    }

    /// Number of samples in the named latency series (0 if absent).
    pub fn latency_count(&self, name: &str) -> usize {
        self.latencies.get(name).map_or(0, |s| s.lock().len())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
