//! End-to-end runs of the full harness against an in-process posting API.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use ledgerload::config::{Config, PhaseConfig, ScenarioConfig, TargetConfig};
use ledgerload::harness::Runner;

#[derive(Clone)]
struct TargetState {
    status: StatusCode,
    hits: Arc<AtomicU64>,
    duplicate_keys: Arc<AtomicU64>,
    seen_keys: Arc<Mutex<HashSet<String>>>,
    last_body: Arc<Mutex<Option<String>>>,
}

impl TargetState {
    fn new(status: StatusCode) -> Self {
        Self {
            status,
            hits: Arc::new(AtomicU64::new(0)),
            duplicate_keys: Arc::new(AtomicU64::new(0)),
            seen_keys: Arc::new(Mutex::new(HashSet::new())),
            last_body: Arc::new(Mutex::new(None)),
        }
    }
}

async fn handle_post(
    State(state): State<TargetState>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, &'static str) {
    state.hits.fetch_add(1, Ordering::Relaxed);

    match headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
    {
        Some(key) => {
            if !state.seen_keys.lock().insert(key.to_string()) {
                state.duplicate_keys.fetch_add(1, Ordering::Relaxed);
            }
        }
        None => {
            // A missing header also counts as a duplicate-key violation.
            state.duplicate_keys.fetch_add(1, Ordering::Relaxed);
        }
    }

    *state.last_body.lock() = Some(body);

    (state.status, "{}")
}

/// Serve the posting endpoint on an ephemeral port, returning the base URL.
async fn spawn_target(state: TargetState) -> String {
    let app = Router::new()
        .route("/v1/posting/events", post(handle_post))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve target");
    });

    format!("http://{addr}")
}

fn run_config(endpoint: String) -> Config {
    Config {
        target: TargetConfig {
            endpoint,
            timeout: Duration::from_secs(2),
            ..Default::default()
        },
        scenario: ScenarioConfig {
            vus: Some(4),
            duration: Some(Duration::from_millis(400)),
            graceful_ramp_down: Duration::from_secs(2),
            ..Default::default()
        },
        pacing: Duration::from_millis(5),
        reconcile_interval: Duration::from_millis(10),
        phases: vec![PhaseConfig {
            name: "steady".to_string(),
            start: Duration::ZERO,
            end: Duration::from_secs(3600),
        }],
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn healthy_target_passes_all_thresholds() {
    let state = TargetState::new(StatusCode::OK);
    let endpoint = spawn_target(state.clone()).await;

    let mut cfg = run_config(endpoint);
    cfg.thresholds
        .insert("checks".to_string(), vec!["rate>=0.995".to_string()]);
    cfg.thresholds
        .insert("api_failures".to_string(), vec!["rate<=0.005".to_string()]);
    cfg.thresholds
        .insert("http_req_failed".to_string(), vec!["rate<=0.005".to_string()]);
    cfg.thresholds
        .insert("steady".to_string(), vec!["p(95)<=10000".to_string()]);
    cfg.validate().expect("valid config");

    let report = Runner::new(cfg)
        .run(CancellationToken::new())
        .await
        .expect("run");

    assert!(report.verdict.passed, "verdict: {}", report.verdict);
    assert_eq!(report.verdict.outcomes.len(), 4);
    assert!(report.verdict.outcomes.iter().all(|o| o.passed));

    assert_eq!(report.ramp.spawned, 4);
    assert_eq!(report.ramp.completed, 4);
    assert_eq!(report.ramp.force_terminated, 0);

    let hits = state.hits.load(Ordering::Relaxed);
    assert!(hits > 0, "target never hit");
    assert_eq!(state.duplicate_keys.load(Ordering::Relaxed), 0);
    assert_eq!(state.seen_keys.lock().len() as u64, hits);

    // The wire payload carries the fixed dual-line posting body.
    let body = state.last_body.lock().clone().expect("captured body");
    let value: serde_json::Value = serde_json::from_str(&body).expect("json body");
    assert_eq!(value["event_type"], "payment.settled.v1");
    let lines = value["lines"].as_array().expect("lines");
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["entry_side"], "debit");
    assert_eq!(lines[1]["entry_side"], "credit");
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_target_fails_rate_thresholds() {
    let state = TargetState::new(StatusCode::INTERNAL_SERVER_ERROR);
    let endpoint = spawn_target(state.clone()).await;

    let mut cfg = run_config(endpoint);
    cfg.thresholds
        .insert("checks".to_string(), vec!["rate>=0.995".to_string()]);
    cfg.thresholds
        .insert("api_failures".to_string(), vec!["rate<=0.005".to_string()]);
    cfg.validate().expect("valid config");

    let report = Runner::new(cfg)
        .run(CancellationToken::new())
        .await
        .expect("run");

    assert!(!report.verdict.passed);
    for outcome in &report.verdict.outcomes {
        assert!(!outcome.passed, "unexpected pass: {outcome}");
    }

    let api_failures = report
        .verdict
        .outcomes
        .iter()
        .find(|o| o.series == "api_failures")
        .expect("api_failures outcome");
    assert_eq!(api_failures.observed, Some(1.0));
}

#[tokio::test(flavor = "multi_thread")]
async fn phase_without_samples_fails_with_no_data() {
    let state = TargetState::new(StatusCode::OK);
    let endpoint = spawn_target(state.clone()).await;

    let mut cfg = run_config(endpoint);
    // A window that opens long after this short run ends.
    cfg.phases.push(PhaseConfig {
        name: "late_window".to_string(),
        start: Duration::from_secs(50),
        end: Duration::from_secs(60),
    });
    cfg.thresholds
        .insert("checks".to_string(), vec!["rate>=0.995".to_string()]);
    cfg.thresholds
        .insert("late_window".to_string(), vec!["p(95)<=300".to_string()]);
    cfg.validate().expect("valid config");

    let report = Runner::new(cfg)
        .run(CancellationToken::new())
        .await
        .expect("run");

    assert!(!report.verdict.passed);

    let late = report
        .verdict
        .outcomes
        .iter()
        .find(|o| o.series == "late_window")
        .expect("late_window outcome");
    assert!(!late.passed);
    assert_eq!(late.observed, None);

    let checks = report
        .verdict
        .outcomes
        .iter()
        .find(|o| o.series == "checks")
        .expect("checks outcome");
    assert!(checks.passed);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_drains_and_still_evaluates() {
    let state = TargetState::new(StatusCode::OK);
    let endpoint = spawn_target(state.clone()).await;

    let mut cfg = run_config(endpoint);
    // A long run we cut short.
    cfg.scenario.duration = Some(Duration::from_secs(3600));
    cfg.thresholds
        .insert("checks".to_string(), vec!["rate>=0.995".to_string()]);
    cfg.validate().expect("valid config");

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        stopper.cancel();
    });

    let report = Runner::new(cfg).run(cancel).await.expect("run");

    assert_eq!(report.ramp.completed, 4);
    assert!(report.verdict.passed);
    assert!(state.hits.load(Ordering::Relaxed) > 0);
}
