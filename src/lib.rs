//! Ramping load harness for the ledger posting API.
//!
//! The harness drives a time-varying number of concurrent workers against
//! `POST /v1/posting/events`, buckets observed latencies into named phase
//! windows of the run, and evaluates the aggregated series against declared
//! SLO thresholds to produce a pass/fail verdict for pipeline gating.

pub mod config;
pub mod harness;
pub mod metrics;
pub mod phase;
pub mod ramp;
pub mod target;
pub mod verdict;
pub mod worker;
