use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::{Registry, API_FAILURES, CHECKS, HTTP_REQ_FAILED};
use crate::phase::{PhaseAttributor, RequestResult};
use crate::target::PostingTarget;

/// Derive the idempotency token for one iteration.
///
/// Worker ids are unique for the run and each worker's iteration counter is
/// monotonic, so tokens are globally unique without coordination.
pub fn idempotency_key(prefix: &str, worker_id: u32, iteration: u64) -> String {
    format!("{prefix}-{worker_id}-{iteration}")
}

/// One virtual user: an owned request loop with explicit identity and
/// iteration counter.
///
/// The loop runs until its drain token is cancelled. A cancellation observed
/// at the top of the loop (or during pacing) stops the worker before it
/// starts another iteration; an in-flight iteration always completes and is
/// recorded. Forced termination after the drain grace is the scheduler's
/// job, via task abort, and discards the in-flight result.
pub struct Worker<T> {
    pub id: u32,
    registry: Arc<Registry>,
    attributor: Arc<PhaseAttributor>,
    target: Arc<T>,
    pacing: Duration,
    expected_status: u16,
    key_prefix: String,
}

impl<T: PostingTarget> Worker<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        registry: Arc<Registry>,
        attributor: Arc<PhaseAttributor>,
        target: Arc<T>,
        pacing: Duration,
        expected_status: u16,
        key_prefix: String,
    ) -> Self {
        Self {
            id,
            registry,
            attributor,
            target,
            pacing,
            expected_status,
            key_prefix,
        }
    }

    /// Run the iteration loop. Returns the number of completed iterations.
    pub async fn run(self, run_start: Instant, drain: CancellationToken) -> u64 {
        let mut iteration: u64 = 0;

        loop {
            if drain.is_cancelled() {
                break;
            }

            let key = idempotency_key(&self.key_prefix, self.id, iteration);

            match self.target.post(&key).await {
                Ok(outcome) => {
                    // Offset taken at response receipt, not dispatch.
                    let offset = run_start.elapsed();
                    let success = outcome.status == self.expected_status;

                    self.registry.record_rate(CHECKS, success);
                    self.registry.record_rate(API_FAILURES, !success);
                    self.registry.record_rate(HTTP_REQ_FAILED, false);

                    self.attributor.attribute(&RequestResult {
                        worker_id: self.id,
                        iteration,
                        offset,
                        latency: outcome.latency,
                        status: outcome.status,
                        success,
                    });
                }
                Err(e) => {
                    // Transport failures are check failures, never fatal.
                    debug!(worker = self.id, iteration, error = %e, "request failed");
                    self.registry.record_rate(CHECKS, false);
                    self.registry.record_rate(API_FAILURES, true);
                    self.registry.record_rate(HTTP_REQ_FAILED, true);
                }
            }

            iteration += 1;

            if !self.pacing.is_zero() {
                tokio::select! {
                    _ = drain.cancelled() => break,
                    _ = tokio::time::sleep(self.pacing) => {}
                }
            }
        }

        debug!(worker = self.id, iterations = iteration, "worker stopped");
        iteration
    }
}
