use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};

use crate::metrics::Registry;

/// Comparison operator of an SLO predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Le,
    Ge,
}

impl CompareOp {
    fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            // Boundary equality passes for both operators.
            CompareOp::Le => observed <= bound,
            CompareOp::Ge => observed >= bound,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompareOp::Le => write!(f, "<="),
            CompareOp::Ge => write!(f, ">="),
        }
    }
}

/// Parsed SLO predicate.
///
/// `Rate` bounds are fractions in `[0, 1]`; `Percentile` bounds are
/// milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Predicate {
    Rate { op: CompareOp, bound: f64 },
    Percentile { pct: f64, op: CompareOp, bound_ms: f64 },
}

impl FromStr for Predicate {
    type Err = anyhow::Error;

    /// Accepts `rate<=x`, `rate>=x`, `p(N)<=x`, `p(N)>=x`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();

        if let Some(rest) = s.strip_prefix("rate") {
            let (op, bound) = split_op(rest)?;
            if !(0.0..=1.0).contains(&bound) {
                bail!("rate bound must be within [0, 1], got {bound}");
            }
            return Ok(Predicate::Rate { op, bound });
        }

        if let Some(rest) = s.strip_prefix("p(") {
            let (pct_str, rest) = rest
                .split_once(')')
                .context("percentile predicate missing closing ')'")?;
            let pct: f64 = pct_str
                .trim()
                .parse()
                .with_context(|| format!("invalid percentile {pct_str:?}"))?;
            if !pct.is_finite() || pct <= 0.0 || pct > 100.0 {
                bail!("percentile must be within (0, 100], got {pct}");
            }
            let (op, bound_ms) = split_op(rest)?;
            if bound_ms < 0.0 {
                bail!("percentile bound must be non-negative, got {bound_ms}");
            }
            return Ok(Predicate::Percentile { pct, op, bound_ms });
        }

        bail!("unrecognized predicate {s:?} (expected rate<=x, rate>=x, p(N)<=x or p(N)>=x)")
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Rate { op, bound } => write!(f, "rate{op}{bound}"),
            Predicate::Percentile { pct, op, bound_ms } => write!(f, "p({pct}){op}{bound_ms}"),
        }
    }
}

fn split_op(s: &str) -> Result<(CompareOp, f64)> {
    let s = s.trim();
    let (op, rest) = if let Some(rest) = s.strip_prefix("<=") {
        (CompareOp::Le, rest)
    } else if let Some(rest) = s.strip_prefix(">=") {
        (CompareOp::Ge, rest)
    } else {
        bail!("expected '<=' or '>=' in predicate, got {s:?}");
    };

    let bound: f64 = rest
        .trim()
        .parse()
        .with_context(|| format!("invalid predicate bound {rest:?}"))?;
    if !bound.is_finite() {
        bail!("predicate bound must be finite");
    }

    Ok((op, bound))
}

/// One declared SLO threshold against a named series.
#[derive(Debug, Clone)]
pub struct Threshold {
    pub series: String,
    pub predicate: Predicate,
}

/// Evaluation outcome for a single threshold.
#[derive(Debug, Clone)]
pub struct ThresholdOutcome {
    pub series: String,
    pub predicate: Predicate,
    /// Observed value: a fraction for rate predicates, milliseconds for
    /// percentile predicates. `None` when the series received no samples.
    pub observed: Option<f64>,
    pub passed: bool,
}

impl fmt::Display for ThresholdOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed { "PASS" } else { "FAIL" };
        match (self.observed, &self.predicate) {
            (Some(v), Predicate::Rate { .. }) => {
                write!(f, "{status} {} {} (observed rate {v:.4})", self.series, self.predicate)
            }
            (Some(v), Predicate::Percentile { pct, .. }) => {
                write!(
                    f,
                    "{status} {} {} (observed p({pct}) {v:.2}ms)",
                    self.series, self.predicate
                )
            }
            (None, _) => write!(f, "{status} {} {} (no data)", self.series, self.predicate),
        }
    }
}

/// Final verdict: overall pass iff every threshold passed.
#[derive(Debug, Clone)]
pub struct RunVerdict {
    pub outcomes: Vec<ThresholdOutcome>,
    pub passed: bool,
}

impl fmt::Display for RunVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "threshold results:")?;
        for outcome in &self.outcomes {
            writeln!(f, "  {outcome}")?;
        }
        write!(f, "overall: {}", if self.passed { "PASS" } else { "FAIL" })
    }
}

/// Evaluate all thresholds against the registry's current state.
///
/// A threshold whose series has no data fails with `observed: None`; it is
/// never treated as vacuously passing.
pub fn evaluate(thresholds: &[Threshold], registry: &Registry) -> RunVerdict {
    let mut outcomes: Vec<ThresholdOutcome> = thresholds
        .iter()
        .map(|threshold| {
            let observed = match threshold.predicate {
                Predicate::Rate { .. } => registry.rate(&threshold.series),
                Predicate::Percentile { pct, .. } => registry
                    .percentile(&threshold.series, pct)
                    .map(|d| d.as_secs_f64() * 1000.0),
            };

            let passed = match (observed, threshold.predicate) {
                (Some(v), Predicate::Rate { op, bound }) => op.holds(v, bound),
                (Some(v), Predicate::Percentile { op, bound_ms, .. }) => op.holds(v, bound_ms),
                (None, _) => false,
            };

            ThresholdOutcome {
                series: threshold.series.clone(),
                predicate: threshold.predicate,
                observed,
                passed,
            }
        })
        .collect();

    outcomes.sort_by(|a, b| a.series.cmp(&b.series));
    let passed = outcomes.iter().all(|o| o.passed);

    RunVerdict { outcomes, passed }
}
