use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::metrics::RATE_SERIES_NAMES;
use crate::phase::PhaseWindow;
use crate::ramp::{RampProfile, RampStage};
use crate::verdict::{Predicate, Threshold};

/// Top-level configuration for a load run.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Target endpoint configuration.
    #[serde(default)]
    pub target: TargetConfig,

    /// Posting event payload identity fields.
    #[serde(default)]
    pub payload: PayloadConfig,

    /// Concurrency scenario: staged ramp or flat load.
    #[serde(default)]
    pub scenario: ScenarioConfig,

    /// Fixed delay between a worker's iterations. Default: 1s.
    #[serde(default = "default_pacing", with = "humantime_serde")]
    pub pacing: Duration,

    /// How often the scheduler reconciles worker count against the ramp
    /// target. Default: 500ms.
    #[serde(default = "default_reconcile_interval", with = "humantime_serde")]
    pub reconcile_interval: Duration,

    /// Named elapsed-time windows latencies are attributed to.
    #[serde(default)]
    pub phases: Vec<PhaseConfig>,

    /// SLO thresholds: series name to predicate strings.
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,
}

/// Target endpoint configuration.
#[derive(Debug, Deserialize)]
pub struct TargetConfig {
    /// Base URL of the posting API (e.g., "http://localhost:3000").
    #[serde(default)]
    pub endpoint: String,

    /// Request path. Default: "/v1/posting/events".
    #[serde(default = "default_target_path")]
    pub path: String,

    /// Per-request timeout. Bounds how long a stalled call can keep a
    /// worker from observing its drain token. Default: 10s.
    #[serde(default = "default_target_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Status code the correctness check expects. Default: 200.
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
}

/// Identity fields of the posting event payload.
#[derive(Debug, Clone, Deserialize)]
pub struct PayloadConfig {
    #[serde(default = "default_event_type")]
    pub event_type: String,
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,
    #[serde(default = "default_legal_entity_id")]
    pub legal_entity_id: String,
    #[serde(default = "default_ledger_book")]
    pub ledger_book: String,
    #[serde(default = "default_accounting_date")]
    pub accounting_date: String,
    #[serde(default = "default_source_event_id")]
    pub source_event_id: String,
    #[serde(default = "default_posting_run_id")]
    pub posting_run_id: String,
    #[serde(default = "default_book_policy_id")]
    pub book_policy_id: String,
    #[serde(default = "default_policy_version")]
    pub policy_version: String,
    #[serde(default = "default_fx_rate_set_id")]
    pub fx_rate_set_id: String,
    #[serde(default = "default_ruleset_version")]
    pub ruleset_version: String,
    #[serde(default = "default_workflow_id")]
    pub workflow_id: String,

    /// Prefix of every idempotency token issued during the run.
    #[serde(default = "default_idempotency_prefix")]
    pub idempotency_prefix: String,
}

/// Concurrency scenario. Either `stages` (ramping, with `start_vus`) or
/// `vus` + `duration` (flat load), never both.
#[derive(Debug, Deserialize)]
pub struct ScenarioConfig {
    /// Concurrency before the first stage begins. Default: 1.
    #[serde(default)]
    pub start_vus: Option<u32>,

    /// Ordered ramp stages.
    #[serde(default)]
    pub stages: Vec<StageConfig>,

    /// Flat-load concurrency.
    #[serde(default)]
    pub vus: Option<u32>,

    /// Flat-load total duration.
    #[serde(default, with = "humantime_serde")]
    pub duration: Option<Duration>,

    /// Grace period for draining workers at scale-down and run end.
    /// Default: 30s.
    #[serde(default = "default_graceful_ramp_down", with = "humantime_serde")]
    pub graceful_ramp_down: Duration,
}

/// One ramp stage.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StageConfig {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub target: u32,
}

/// One named phase window over elapsed run time. Bounds are inclusive.
#[derive(Debug, Clone, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    #[serde(with = "humantime_serde")]
    pub start: Duration,
    #[serde(with = "humantime_serde")]
    pub end: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pacing() -> Duration {
    Duration::from_secs(1)
}

fn default_reconcile_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_target_path() -> String {
    "/v1/posting/events".to_string()
}

fn default_target_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_expected_status() -> u16 {
    200
}

fn default_event_type() -> String {
    "payment.settled.v1".to_string()
}

fn default_tenant_id() -> String {
    "tenant_1".to_string()
}

fn default_legal_entity_id() -> String {
    "US_CO_01".to_string()
}

fn default_ledger_book() -> String {
    "US_GAAP".to_string()
}

fn default_accounting_date() -> String {
    "2026-02-21".to_string()
}

fn default_source_event_id() -> String {
    "evt-load".to_string()
}

fn default_posting_run_id() -> String {
    "run-load".to_string()
}

fn default_book_policy_id() -> String {
    "policy_dual_book".to_string()
}

fn default_policy_version() -> String {
    "1.0.0".to_string()
}

fn default_fx_rate_set_id() -> String {
    "fx_2026_02_21".to_string()
}

fn default_ruleset_version() -> String {
    "v1".to_string()
}

fn default_workflow_id() -> String {
    "wf-load".to_string()
}

fn default_idempotency_prefix() -> String {
    "load".to_string()
}

fn default_graceful_ramp_down() -> Duration {
    Duration::from_secs(30)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            target: TargetConfig::default(),
            payload: PayloadConfig::default(),
            scenario: ScenarioConfig::default(),
            pacing: default_pacing(),
            reconcile_interval: default_reconcile_interval(),
            phases: Vec::new(),
            thresholds: BTreeMap::new(),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            path: default_target_path(),
            timeout: default_target_timeout(),
            expected_status: default_expected_status(),
        }
    }
}

impl Default for PayloadConfig {
    fn default() -> Self {
        Self {
            event_type: default_event_type(),
            tenant_id: default_tenant_id(),
            legal_entity_id: default_legal_entity_id(),
            ledger_book: default_ledger_book(),
            accounting_date: default_accounting_date(),
            source_event_id: default_source_event_id(),
            posting_run_id: default_posting_run_id(),
            book_policy_id: default_book_policy_id(),
            policy_version: default_policy_version(),
            fx_rate_set_id: default_fx_rate_set_id(),
            ruleset_version: default_ruleset_version(),
            workflow_id: default_workflow_id(),
            idempotency_prefix: default_idempotency_prefix(),
        }
    }
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            start_vus: None,
            stages: Vec::new(),
            vus: None,
            duration: None,
            graceful_ramp_down: default_graceful_ramp_down(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration. Every error here is fatal before any
    /// worker is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.target.endpoint.is_empty() {
            bail!("target.endpoint is required");
        }

        if !self.target.path.starts_with('/') {
            bail!("target.path must start with '/'");
        }

        if self.target.timeout.is_zero() {
            bail!("target.timeout must be positive");
        }

        if !(100..=599).contains(&self.target.expected_status) {
            bail!(
                "target.expected_status must be a valid status code, got {}",
                self.target.expected_status
            );
        }

        if self.reconcile_interval.is_zero() {
            bail!("reconcile_interval must be positive");
        }

        let ramping = !self.scenario.stages.is_empty();
        let flat = self.scenario.vus.is_some() || self.scenario.duration.is_some();

        if ramping && flat {
            bail!("scenario cannot combine stages with flat vus/duration");
        }
        if !ramping {
            if self.scenario.vus.is_none() || self.scenario.duration.is_none() {
                bail!("scenario requires either stages or both vus and duration");
            }
            if self.scenario.duration.unwrap_or(Duration::ZERO).is_zero() {
                bail!("scenario.duration must be positive");
            }
        }

        for (i, stage) in self.scenario.stages.iter().enumerate() {
            if stage.duration.is_zero() {
                bail!("scenario.stages[{i}].duration must be positive");
            }
        }

        let mut phase_names = HashSet::new();
        for (i, phase) in self.phases.iter().enumerate() {
            if phase.name.is_empty() {
                bail!("phases[{i}].name must not be empty");
            }
            if RATE_SERIES_NAMES.contains(&phase.name.as_str()) {
                bail!(
                    "phase name {:?} collides with a built-in rate series",
                    phase.name
                );
            }
            if phase.end < phase.start {
                bail!("phase {:?} ends before it starts", phase.name);
            }
            if !phase_names.insert(phase.name.clone()) {
                bail!("duplicate phase name {:?}", phase.name);
            }
        }

        self.parsed_thresholds()?;

        Ok(())
    }

    /// Parse and cross-check the declared thresholds.
    ///
    /// Rate predicates must target a built-in rate series; percentile
    /// predicates must target a configured phase window.
    pub fn parsed_thresholds(&self) -> Result<Vec<Threshold>> {
        let phase_names: HashSet<&str> = self.phases.iter().map(|p| p.name.as_str()).collect();
        let mut thresholds = Vec::new();

        for (series, predicates) in &self.thresholds {
            if predicates.is_empty() {
                bail!("thresholds for {series:?} must declare at least one predicate");
            }

            for raw in predicates {
                let predicate: Predicate = raw
                    .parse()
                    .with_context(|| format!("invalid threshold {raw:?} on series {series:?}"))?;

                match predicate {
                    Predicate::Rate { .. } => {
                        if !RATE_SERIES_NAMES.contains(&series.as_str()) {
                            bail!(
                                "rate threshold targets unknown series {series:?} \
                                 (valid: {RATE_SERIES_NAMES:?})"
                            );
                        }
                    }
                    Predicate::Percentile { .. } => {
                        if !phase_names.contains(series.as_str()) {
                            bail!(
                                "percentile threshold targets {series:?}, \
                                 which is not a configured phase"
                            );
                        }
                    }
                }

                thresholds.push(Threshold {
                    series: series.clone(),
                    predicate,
                });
            }
        }

        Ok(thresholds)
    }

    /// Build the ramp profile implied by the scenario.
    pub fn ramp_profile(&self) -> RampProfile {
        if self.scenario.stages.is_empty() {
            return RampProfile::flat(
                self.scenario.vus.unwrap_or(1),
                self.scenario.graceful_ramp_down,
            );
        }

        RampProfile {
            start_vus: self.scenario.start_vus.unwrap_or(1),
            stages: self
                .scenario
                .stages
                .iter()
                .map(|s| RampStage {
                    duration: s.duration,
                    target: s.target,
                })
                .collect(),
            graceful_ramp_down: self.scenario.graceful_ramp_down,
        }
    }

    /// Total run duration: the stage sum for a ramp, the configured
    /// duration for flat load.
    pub fn run_duration(&self) -> Duration {
        if self.scenario.stages.is_empty() {
            self.scenario.duration.unwrap_or(Duration::ZERO)
        } else {
            self.ramp_profile().total_duration()
        }
    }

    /// Phase windows for the attributor.
    pub fn phase_windows(&self) -> Vec<PhaseWindow> {
        self.phases
            .iter()
            .map(|p| PhaseWindow {
                name: p.name.clone(),
                start: p.start,
                end: p.end,
            })
            .collect()
    }
}
