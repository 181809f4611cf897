use std::sync::Arc;
use std::time::Duration;

use crate::metrics::Registry;

/// One completed worker iteration, as observed at response receipt.
#[derive(Debug, Clone, Copy)]
pub struct RequestResult {
    pub worker_id: u32,
    pub iteration: u64,
    /// Elapsed run time when the response was received.
    pub offset: Duration,
    pub latency: Duration,
    pub status: u16,
    pub success: bool,
}

/// A named, inclusive interval of elapsed run time.
#[derive(Debug, Clone)]
pub struct PhaseWindow {
    pub name: String,
    pub start: Duration,
    pub end: Duration,
}

impl PhaseWindow {
    /// Whether the elapsed offset falls inside this window. Both bounds are
    /// inclusive.
    pub fn contains(&self, offset: Duration) -> bool {
        offset >= self.start && offset <= self.end
    }
}

/// Routes completed request latencies into the latency series of every
/// phase window containing the request's elapsed offset.
///
/// Windows may overlap and need not cover the run; a result can land in
/// zero, one, or many phases. Attributions of different results are
/// independent commutative writes, so no ordering is required between
/// workers.
pub struct PhaseAttributor {
    windows: Vec<PhaseWindow>,
    registry: Arc<Registry>,
}

impl PhaseAttributor {
    pub fn new(windows: Vec<PhaseWindow>, registry: Arc<Registry>) -> Self {
        Self { windows, registry }
    }

    /// Attribute one result's latency to all matching phase windows.
    pub fn attribute(&self, result: &RequestResult) {
        for window in &self.windows {
            if window.contains(result.offset) {
                self.registry.record_latency(&window.name, result.latency);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(name: &str, start_secs: u64, end_secs: u64) -> PhaseWindow {
        PhaseWindow {
            name: name.to_string(),
            start: Duration::from_secs(start_secs),
            end: Duration::from_secs(end_secs),
        }
    }

    fn result_at(offset: Duration) -> RequestResult {
        RequestResult {
            worker_id: 1,
            iteration: 0,
            offset,
            latency: Duration::from_millis(42),
            status: 200,
            success: true,
        }
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let w = window("p", 300, 600);
        assert!(w.contains(Duration::from_secs(300)));
        assert!(w.contains(Duration::from_secs(600)));
        assert!(!w.contains(Duration::from_secs(300) - Duration::from_millis(1)));
        assert!(!w.contains(Duration::from_secs(600) + Duration::from_millis(1)));
    }

    #[test]
    fn test_sample_on_boundary_is_attributed() {
        let registry = Arc::new(Registry::new());
        let attributor =
            PhaseAttributor::new(vec![window("warmup", 0, 300)], Arc::clone(&registry));

        attributor.attribute(&result_at(Duration::from_secs(300)));
        assert_eq!(registry.latency_count("warmup"), 1);

        attributor.attribute(&result_at(Duration::from_secs(300) + Duration::from_millis(1)));
        assert_eq!(registry.latency_count("warmup"), 1);
    }

    #[test]
    fn test_overlapping_windows_both_receive_sample() {
        let registry = Arc::new(Registry::new());
        let attributor = PhaseAttributor::new(
            vec![window("first_half", 0, 900), window("full_run", 0, 1800)],
            Arc::clone(&registry),
        );

        attributor.attribute(&result_at(Duration::from_secs(600)));
        assert_eq!(registry.latency_count("first_half"), 1);
        assert_eq!(registry.latency_count("full_run"), 1);

        attributor.attribute(&result_at(Duration::from_secs(1200)));
        assert_eq!(registry.latency_count("first_half"), 1);
        assert_eq!(registry.latency_count("full_run"), 2);
    }

    #[test]
    fn test_sample_outside_every_window_is_dropped() {
        let registry = Arc::new(Registry::new());
        let attributor =
            PhaseAttributor::new(vec![window("tail", 900, 1800)], Arc::clone(&registry));

        attributor.attribute(&result_at(Duration::from_secs(100)));
        assert_eq!(registry.latency_count("tail"), 0);
    }
}
