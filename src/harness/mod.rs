use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::metrics::{Registry, API_FAILURES, CHECKS};
use crate::phase::PhaseAttributor;
use crate::ramp::{RampSummary, Scheduler, SpawnFn};
use crate::target::HttpTarget;
use crate::verdict::{self, RunVerdict};
use crate::worker::Worker;

/// Final output of one load run.
#[derive(Debug)]
pub struct RunReport {
    pub verdict: RunVerdict,
    pub ramp: RampSummary,
}

/// Runner wires registry, attributor, target, and scheduler together and
/// executes one complete load run.
pub struct Runner {
    cfg: Config,
}

impl Runner {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Execute the run to completion (or until `cancel` fires), then
    /// evaluate the declared thresholds against the aggregated series.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport> {
        // Thresholds were checked at config validation; parsing again here
        // yields the owned list the evaluator needs.
        let thresholds = self.cfg.parsed_thresholds()?;

        let registry = Arc::new(Registry::new());
        let attributor = Arc::new(PhaseAttributor::new(
            self.cfg.phase_windows(),
            Arc::clone(&registry),
        ));
        let target = Arc::new(
            HttpTarget::new(&self.cfg.target, &self.cfg.payload)
                .context("building posting target")?,
        );

        let run_start = Instant::now();

        let spawn: SpawnFn = {
            let registry = Arc::clone(&registry);
            let pacing = self.cfg.pacing;
            let expected_status = self.cfg.target.expected_status;
            let key_prefix = self.cfg.payload.idempotency_prefix.clone();

            Box::new(move |id, drain| {
                let worker = Worker::new(
                    id,
                    Arc::clone(&registry),
                    Arc::clone(&attributor),
                    Arc::clone(&target),
                    pacing,
                    expected_status,
                    key_prefix.clone(),
                );
                tokio::spawn(worker.run(run_start, drain))
            })
        };

        let scheduler = Scheduler::new(
            self.cfg.ramp_profile(),
            self.cfg.run_duration(),
            self.cfg.reconcile_interval,
            spawn,
        );

        info!(
            endpoint = %self.cfg.target.endpoint,
            run_duration = ?self.cfg.run_duration(),
            pacing = ?self.cfg.pacing,
            thresholds = thresholds.len(),
            "run starting",
        );

        let progress = spawn_progress_reporter(Arc::clone(&registry), run_start);
        let ramp = scheduler.run(run_start, cancel).await;
        progress.cancel();

        let verdict = verdict::evaluate(&thresholds, &registry);

        info!(
            passed = verdict.passed,
            thresholds = verdict.outcomes.len(),
            iterations = ramp.iterations,
            "run finished",
        );

        Ok(RunReport { verdict, ramp })
    }
}

/// Spawn a background task logging run progress every 10 seconds. Returns
/// the token that stops it.
fn spawn_progress_reporter(registry: Arc<Registry>, run_start: Instant) -> CancellationToken {
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip the immediate first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let Some((_, total)) = registry.rate_counts(CHECKS) else {
                        continue;
                    };
                    let failure_rate = registry.rate(API_FAILURES).unwrap_or(0.0);
                    info!(
                        elapsed = ?run_start.elapsed(),
                        iterations = total,
                        failure_rate = format!("{failure_rate:.4}"),
                        "progress",
                    );
                }
            }
        }
    });

    stopper
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScenarioConfig;

    fn zero_worker_config() -> Config {
        Config {
            target: crate::config::TargetConfig {
                endpoint: "http://127.0.0.1:9".to_string(),
                ..Default::default()
            },
            scenario: ScenarioConfig {
                vus: Some(0),
                duration: Some(Duration::from_millis(50)),
                ..Default::default()
            },
            reconcile_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_zero_worker_run_reports_no_data() {
        let mut cfg = zero_worker_config();
        cfg.thresholds
            .insert("checks".to_string(), vec!["rate>=0.995".to_string()]);
        cfg.validate().expect("valid config");

        let report = Runner::new(cfg)
            .run(CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(report.ramp.spawned, 0);
        assert!(!report.verdict.passed);
        assert_eq!(report.verdict.outcomes[0].observed, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_with_no_thresholds_passes() {
        let cfg = zero_worker_config();
        cfg.validate().expect("valid config");

        let report = Runner::new(cfg)
            .run(CancellationToken::new())
            .await
            .expect("run");

        assert!(report.verdict.passed);
        assert!(report.verdict.outcomes.is_empty());
    }
}
