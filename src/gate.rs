//! Quality gate evaluation for stage transitions.
//!
//! This module provides:
//! - `QualityMetric` / `MetricReading` — values reported by a stage worker
//! - `ThresholdSpec` — a per-metric bound declared in configuration
//! - `GateResult` — the allow/block decision with per-threshold detail
//! - `QualityGateEngine` — evaluates a stage's metrics against its thresholds
//!
//! Evaluation is pure: no I/O, no mutation, and the same inputs always yield
//! the same `GateResult`. A stage is blocked if *any* configured threshold is
//! violated, and a configured metric the worker did not report counts as a
//! violation (fail-closed).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::stage::Stage;

/// A raw metric as emitted by a worker, before the producing stage is known
/// to the record keeper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricReading {
    /// Metric name, e.g. "coverage" or "critical_defects"
    pub name: String,
    /// Numeric value; percentages are expressed as 0..100
    pub value: f64,
    /// Optional unit, e.g. "percent" or "count"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// A metric attributed to the stage that produced it. Appended to the run's
/// metric log, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetric {
    pub name: String,
    pub stage_produced: Stage,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl QualityMetric {
    /// Attribute a worker reading to the stage that produced it.
    pub fn from_reading(stage: Stage, reading: MetricReading) -> Self {
        Self {
            name: reading.name,
            stage_produced: stage,
            value: reading.value,
            unit: reading.unit,
        }
    }
}

/// A declared bound for one metric. All set bounds must hold.
///
/// The TOML shape mirrors the fields: `coverage = { min = 80.0 }`,
/// `critical_defects = { eq = 0.0 }`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ThresholdSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eq: Option<f64>,
}

impl ThresholdSpec {
    pub fn min(value: f64) -> Self {
        Self {
            min: Some(value),
            ..Default::default()
        }
    }

    pub fn max(value: f64) -> Self {
        Self {
            max: Some(value),
            ..Default::default()
        }
    }

    pub fn eq(value: f64) -> Self {
        Self {
            eq: Some(value),
            ..Default::default()
        }
    }

    /// Check a reported value against every set bound.
    pub fn holds(&self, actual: f64) -> bool {
        if let Some(min) = self.min
            && actual < min
        {
            return false;
        }
        if let Some(max) = self.max
            && actual > max
        {
            return false;
        }
        if let Some(eq) = self.eq
            && actual != eq
        {
            return false;
        }
        true
    }

    /// Human-readable description of the bound, e.g. ">= 80".
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(min) = self.min {
            parts.push(format!(">= {}", fmt_value(min)));
        }
        if let Some(max) = self.max {
            parts.push(format!("<= {}", fmt_value(max)));
        }
        if let Some(eq) = self.eq {
            parts.push(format!("== {}", fmt_value(eq)));
        }
        if parts.is_empty() {
            "(unbounded)".to_string()
        } else {
            parts.join(" and ")
        }
    }

    /// Why `actual` violates this spec, phrased as "60 < required 80".
    /// Only meaningful when `holds` returned false.
    fn explain_violation(&self, actual: f64) -> String {
        if let Some(min) = self.min
            && actual < min
        {
            return format!("{} < required {}", fmt_value(actual), fmt_value(min));
        }
        if let Some(max) = self.max
            && actual > max
        {
            return format!("{} > allowed {}", fmt_value(actual), fmt_value(max));
        }
        if let Some(eq) = self.eq
            && actual != eq
        {
            return format!("{} != required {}", fmt_value(actual), fmt_value(eq));
        }
        // holds() was true; callers only ask about failures
        String::new()
    }
}

/// Print whole numbers without a trailing ".0" so remediation text reads
/// "coverage 60 < required 80" rather than "60.0 < required 80.0".
fn fmt_value(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// The gate's verdict for one stage evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Allow,
    Block,
}

/// One evaluated threshold, kept for the audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCheck {
    /// Metric name the threshold applies to
    pub metric: String,
    /// The declared bound, e.g. ">= 80"
    pub threshold: String,
    /// Reported value; `None` when the worker never reported the metric
    pub actual: Option<f64>,
    pub passed: bool,
}

/// Immutable result of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub decision: GateDecision,
    /// Every configured threshold for the stage, in metric-name order
    pub checks: Vec<ThresholdCheck>,
    /// Deterministic text derived from the failing checks; `None` on Allow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl GateResult {
    pub fn allows(&self) -> bool {
        self.decision == GateDecision::Allow
    }

    /// The checks that failed, in evaluation order.
    pub fn failing_checks(&self) -> impl Iterator<Item = &ThresholdCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// Evaluates per-stage metric thresholds.
///
/// Thresholds are declared per stage, per metric, in the pipeline
/// configuration. A stage with no configured thresholds always passes.
#[derive(Debug, Clone, Default)]
pub struct QualityGateEngine {
    thresholds: BTreeMap<Stage, BTreeMap<String, ThresholdSpec>>,
}

impl QualityGateEngine {
    pub fn new(thresholds: BTreeMap<Stage, BTreeMap<String, ThresholdSpec>>) -> Self {
        Self { thresholds }
    }

    /// Thresholds configured for one stage, if any.
    pub fn stage_thresholds(&self, stage: Stage) -> Option<&BTreeMap<String, ThresholdSpec>> {
        self.thresholds.get(&stage)
    }

    /// Evaluate a stage's reported metrics against its configured thresholds.
    ///
    /// When a metric is reported more than once, the last reading wins.
    pub fn evaluate(&self, stage: Stage, metrics: &[QualityMetric]) -> GateResult {
        let Some(specs) = self.thresholds.get(&stage) else {
            return GateResult {
                decision: GateDecision::Allow,
                checks: Vec::new(),
                remediation: None,
            };
        };

        let mut reported: BTreeMap<&str, f64> = BTreeMap::new();
        for metric in metrics {
            reported.insert(metric.name.as_str(), metric.value);
        }

        let mut checks = Vec::with_capacity(specs.len());
        let mut failures = Vec::new();

        for (name, spec) in specs {
            match reported.get(name.as_str()) {
                Some(&actual) => {
                    let passed = spec.holds(actual);
                    if !passed {
                        failures.push(format!("{} {}", name, spec.explain_violation(actual)));
                    }
                    checks.push(ThresholdCheck {
                        metric: name.clone(),
                        threshold: spec.describe(),
                        actual: Some(actual),
                        passed,
                    });
                }
                None => {
                    // Fail-closed: a configured metric the stage never
                    // reported blocks the transition.
                    failures.push(format!(
                        "metric '{}' required by stage {} was not reported",
                        name, stage
                    ));
                    checks.push(ThresholdCheck {
                        metric: name.clone(),
                        threshold: spec.describe(),
                        actual: None,
                        passed: false,
                    });
                }
            }
        }

        if failures.is_empty() {
            GateResult {
                decision: GateDecision::Allow,
                checks,
                remediation: None,
            }
        } else {
            GateResult {
                decision: GateDecision::Block,
                checks,
                remediation: Some(failures.join("; ")),
            }
        }
    }
}
