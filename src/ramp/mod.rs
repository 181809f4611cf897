use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One ramp stage: converge to `target` concurrency over `duration`.
#[derive(Debug, Clone, Copy)]
pub struct RampStage {
    pub duration: Duration,
    pub target: u32,
}

/// Staged concurrency profile for a run.
#[derive(Debug, Clone)]
pub struct RampProfile {
    pub start_vus: u32,
    pub stages: Vec<RampStage>,
    /// How long draining workers get to finish their in-flight iteration
    /// before being forcibly terminated.
    pub graceful_ramp_down: Duration,
}

impl RampProfile {
    /// Flat-load profile: constant concurrency, no stages.
    pub fn flat(vus: u32, graceful_ramp_down: Duration) -> Self {
        Self {
            start_vus: vus,
            stages: Vec::new(),
            graceful_ramp_down,
        }
    }

    /// Target concurrency at the given elapsed run time.
    ///
    /// Within a stage the target interpolates linearly from the previous
    /// stage's target (or `start_vus`) to the stage's target, reaching it
    /// exactly at the stage boundary. After the last stage the final target
    /// holds. An empty profile holds `start_vus` forever.
    pub fn target_at(&self, elapsed: Duration) -> u32 {
        let mut from = self.start_vus;
        let mut stage_start = Duration::ZERO;

        for stage in &self.stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                let into = (elapsed - stage_start).as_secs_f64();
                let span = stage.duration.as_secs_f64();
                let delta = f64::from(stage.target) - f64::from(from);
                return (f64::from(from) + delta * (into / span)).round() as u32;
            }
            from = stage.target;
            stage_start = stage_end;
        }

        from
    }

    /// Total duration of all stages (zero for a flat profile).
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }
}

/// Spawns one worker task. Receives the worker id and its drain token and
/// returns the task handle, which resolves to the worker's iteration count.
pub type SpawnFn = Box<dyn Fn(u32, CancellationToken) -> JoinHandle<u64> + Send + Sync>;

struct WorkerHandle {
    id: u32,
    drain: CancellationToken,
    join: JoinHandle<u64>,
}

struct DrainingWorker {
    id: u32,
    join: JoinHandle<u64>,
    /// When the drain grace expires and the worker gets aborted.
    deadline: tokio::time::Instant,
}

/// Outcome counters for one scheduler run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RampSummary {
    /// Workers spawned over the whole run.
    pub spawned: u32,
    /// Workers that drained cleanly.
    pub completed: u32,
    /// Workers aborted after the drain grace expired.
    pub force_terminated: u32,
    /// Completed iterations across cleanly drained workers.
    pub iterations: u64,
}

/// Drives actual worker concurrency toward the profile's target.
///
/// A reconciliation loop compares the active worker count to
/// `target_at(elapsed)` every tick: too few workers and it spawns the
/// difference, too many and it marks the newest workers draining. Draining
/// workers finish their in-flight iteration and exit on their own; the
/// scheduler never touches in-flight request state, only lifecycle tokens.
pub struct Scheduler {
    profile: RampProfile,
    run_duration: Duration,
    reconcile_interval: Duration,
    spawn: SpawnFn,
    active: Vec<WorkerHandle>,
    draining: Vec<DrainingWorker>,
    next_id: u32,
    completed: u32,
    force_terminated: u32,
    iterations: u64,
}

impl Scheduler {
    pub fn new(
        profile: RampProfile,
        run_duration: Duration,
        reconcile_interval: Duration,
        spawn: SpawnFn,
    ) -> Self {
        Self {
            profile,
            run_duration,
            reconcile_interval,
            spawn,
            active: Vec::new(),
            draining: Vec::new(),
            next_id: 0,
            completed: 0,
            force_terminated: 0,
            iterations: 0,
        }
    }

    /// Run the reconciliation loop until the run duration elapses or the
    /// cancellation token fires, then drain all workers.
    pub async fn run(mut self, run_start: Instant, cancel: CancellationToken) -> RampSummary {
        let mut ticker = tokio::time::interval(self.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stop requested, draining workers");
                    break;
                }
                _ = ticker.tick() => {
                    let elapsed = run_start.elapsed();
                    if elapsed >= self.run_duration {
                        info!(?elapsed, "run duration reached, draining workers");
                        break;
                    }
                    self.reap_draining().await;
                    self.reconcile(elapsed);
                }
            }
        }

        self.drain_all().await
    }

    fn reconcile(&mut self, elapsed: Duration) {
        let target = self.profile.target_at(elapsed) as usize;
        let current = self.active.len();

        if current < target {
            for _ in 0..(target - current) {
                let id = self.next_id;
                self.next_id += 1;

                let drain = CancellationToken::new();
                let join = (self.spawn)(id, drain.clone());
                self.active.push(WorkerHandle { id, drain, join });
            }
            debug!(?elapsed, target, spawned = target - current, "scaled up");
        } else if current > target {
            // Newest-first keeps long-lived workers stable across ramp
            // oscillations.
            let deadline = tokio::time::Instant::now() + self.profile.graceful_ramp_down;
            for _ in 0..(current - target) {
                if let Some(handle) = self.active.pop() {
                    handle.drain.cancel();
                    debug!(worker = handle.id, "worker draining");
                    self.draining.push(DrainingWorker {
                        id: handle.id,
                        join: handle.join,
                        deadline,
                    });
                }
            }
            debug!(?elapsed, target, "scaled down");
        }
    }

    /// Collect draining workers that exited and abort any still alive past
    /// their grace deadline. Runs on every reconciliation tick so mid-run
    /// scale-downs enforce the grace too, not just end-of-run drain.
    async fn reap_draining(&mut self) {
        let now = tokio::time::Instant::now();

        for mut worker in std::mem::take(&mut self.draining) {
            if worker.join.is_finished() {
                match (&mut worker.join).await {
                    Ok(iterations) => {
                        self.completed += 1;
                        self.iterations += iterations;
                    }
                    Err(e) => {
                        warn!(worker = worker.id, error = %e, "worker task failed");
                        self.force_terminated += 1;
                    }
                }
            } else if now >= worker.deadline {
                warn!(worker = worker.id, "drain grace expired, terminating worker");
                worker.join.abort();
                self.force_terminated += 1;
            } else {
                self.draining.push(worker);
            }
        }
    }

    /// Drain every remaining worker, force-aborting any still alive when
    /// the grace period expires. Aborted workers' in-flight results are
    /// discarded, counted neither as success nor failure.
    async fn drain_all(mut self) -> RampSummary {
        let deadline = tokio::time::Instant::now() + self.profile.graceful_ramp_down;

        for handle in &self.active {
            handle.drain.cancel();
        }

        // Workers already draining from a mid-run scale-down keep their
        // earlier deadlines.
        let remaining: Vec<DrainingWorker> = self
            .active
            .drain(..)
            .map(|h| DrainingWorker {
                id: h.id,
                join: h.join,
                deadline,
            })
            .chain(self.draining.drain(..))
            .collect();

        let mut summary = RampSummary {
            spawned: self.next_id,
            completed: self.completed,
            force_terminated: self.force_terminated,
            iterations: self.iterations,
        };

        for mut worker in remaining {
            tokio::select! {
                res = &mut worker.join => {
                    match res {
                        Ok(iterations) => {
                            summary.completed += 1;
                            summary.iterations += iterations;
                        }
                        Err(e) => {
                            warn!(worker = worker.id, error = %e, "worker task failed");
                            summary.force_terminated += 1;
                        }
                    }
                }
                _ = tokio::time::sleep_until(worker.deadline) => {
                    warn!(worker = worker.id, "drain grace expired, terminating worker");
                    worker.join.abort();
                    summary.force_terminated += 1;
                }
            }
        }

        info!(
            spawned = summary.spawned,
            completed = summary.completed,
            force_terminated = summary.force_terminated,
            iterations = summary.iterations,
            "ramp finished",
        );

        summary
    }
}
