use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::{PayloadConfig, TargetConfig};

/// HTTP header carrying the per-iteration idempotency token.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Observed outcome of one posting request that reached the server.
#[derive(Debug, Clone, Copy)]
pub struct PostOutcome {
    pub status: u16,
    pub latency: Duration,
}

/// Transport collaborator every worker posts through.
///
/// An `Err` means the transport failed (connection error, timeout) before a
/// status code was observed; callers treat that as a check failure, not a
/// fatal error.
pub trait PostingTarget: Send + Sync {
    fn post(
        &self,
        idempotency_key: &str,
    ) -> impl std::future::Future<Output = Result<PostOutcome>> + Send;
}

/// HTTP posting target backed by `reqwest`.
///
/// The JSON body is identical for every iteration, so it is serialized once
/// at construction; only the idempotency header varies per request.
pub struct HttpTarget {
    http: reqwest::Client,
    url: String,
    body: String,
}

impl HttpTarget {
    pub fn new(cfg: &TargetConfig, payload: &PayloadConfig) -> Result<Self> {
        // A zero timeout is rejected at config validation.
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        let body = serde_json::to_string(&PostingEvent::from_config(payload))
            .context("serializing posting event payload")?;

        Ok(Self {
            http,
            url: format!("{}{}", cfg.endpoint, cfg.path),
            body,
        })
    }

    /// The serialized request body sent on every iteration.
    pub fn body(&self) -> &str {
        &self.body
    }
}

impl PostingTarget for HttpTarget {
    async fn post(&self, idempotency_key: &str) -> Result<PostOutcome> {
        let start = Instant::now();

        let response = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .body(self.body.clone())
            .send()
            .await
            .context("posting event")?;

        let status = response.status().as_u16();

        // Drain the body so the connection returns to the pool; latency
        // covers the full response, matching the source measurement.
        let _ = response.bytes().await;
        let latency = start.elapsed();

        Ok(PostOutcome { status, latency })
    }
}

// --- Posting event payload ---

#[derive(Debug, Serialize)]
struct PostingEvent {
    event_type: String,
    tenant_id: String,
    legal_entity_id: String,
    ledger_book: String,
    accounting_date: String,
    source_event_id: String,
    posting_run_id: String,
    lines: Vec<PostingLine>,
    provenance: Provenance,
}

#[derive(Debug, Serialize)]
struct PostingLine {
    account_id: &'static str,
    entry_side: &'static str,
    amount_minor: u64,
    currency: &'static str,
    base_amount_minor: u64,
    base_currency: &'static str,
}

#[derive(Debug, Serialize)]
struct Provenance {
    book_policy_id: String,
    policy_version: String,
    fx_rate_set_id: String,
    ruleset_version: String,
    workflow_id: String,
}

impl PostingEvent {
    /// Fixed dual-line debit/credit template with config-supplied identity.
    fn from_config(cfg: &PayloadConfig) -> Self {
        Self {
            event_type: cfg.event_type.clone(),
            tenant_id: cfg.tenant_id.clone(),
            legal_entity_id: cfg.legal_entity_id.clone(),
            ledger_book: cfg.ledger_book.clone(),
            accounting_date: cfg.accounting_date.clone(),
            source_event_id: cfg.source_event_id.clone(),
            posting_run_id: cfg.posting_run_id.clone(),
            lines: vec![
                PostingLine {
                    account_id: "1105",
                    entry_side: "debit",
                    amount_minor: 10_000,
                    currency: "USD",
                    base_amount_minor: 10_000,
                    base_currency: "USD",
                },
                PostingLine {
                    account_id: "4000",
                    entry_side: "credit",
                    amount_minor: 10_000,
                    currency: "USD",
                    base_amount_minor: 10_000,
                    base_currency: "USD",
                },
            ],
            provenance: Provenance {
                book_policy_id: cfg.book_policy_id.clone(),
                policy_version: cfg.policy_version.clone(),
                fx_rate_set_id: cfg.fx_rate_set_id.clone(),
                ruleset_version: cfg.ruleset_version.clone(),
                workflow_id: cfg.workflow_id.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_schema() {
        let payload = PayloadConfig::default();
        let event = PostingEvent::from_config(&payload);
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).expect("serialize"))
                .expect("round trip");

        assert_eq!(value["event_type"], "payment.settled.v1");
        assert_eq!(value["tenant_id"], "tenant_1");
        assert_eq!(value["ledger_book"], "US_GAAP");

        let lines = value["lines"].as_array().expect("lines array");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["entry_side"], "debit");
        assert_eq!(lines[1]["entry_side"], "credit");
        assert_eq!(lines[0]["amount_minor"], 10_000);
        assert_eq!(lines[0]["account_id"], "1105");
        assert_eq!(lines[1]["account_id"], "4000");

        assert_eq!(value["provenance"]["book_policy_id"], "policy_dual_book");
        assert_eq!(value["provenance"]["policy_version"], "1.0.0");
    }

    #[test]
    fn test_body_built_once() {
        let target = HttpTarget::new(&TargetConfig::default(), &PayloadConfig::default())
            .expect("build target");
        assert!(target.body().contains("\"event_type\""));
        assert!(target.body().contains("\"lines\""));
    }
}
