//! Drift detection over a metric's audited history.
//!
//! A series is fitted with ordinary least squares against elapsed days and the
//! slope is tested with a two-sided Student-t test. A significant slope is
//! flagged only when the configured [`DriftCriterion`] also holds, so the
//! outcome is a deterministic function of the points, the rule, and the policy.

pub mod regression;
pub mod stats;

use chrono::{DateTime, Utc};
use qc_protocol::{AuditRecord, DriftAssessment, DriftVerdict, ToleranceRule};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SECONDS_PER_DAY: f64 = 86_400.0;
/// A slope test needs residual degrees of freedom, hence three readings.
pub const MIN_DISTINCT_TIMESTAMPS: usize = 3;

#[derive(Debug, Error, Clone, PartialEq)]
#[error("invalid drift policy: {0}")]
pub struct InvalidDriftPolicy(pub String);

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftCriterion {
    /// The trend line, extended by one expected reading interval, leaves the
    /// tolerance window.
    ProjectedBreach,
    /// `|slope|` per day exceeds this fraction of the tolerance window width.
    SlopeFraction { fraction: f64 },
    /// `|slope|` per day exceeds a fixed value in the metric's unit.
    AbsoluteSlope { max_per_day: f64 },
}

impl Default for DriftCriterion {
    fn default() -> Self {
        Self::ProjectedBreach
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DriftPolicy {
    #[serde(default = "default_min_points")]
    pub min_points: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default)]
    pub criterion: DriftCriterion,
}

fn default_min_points() -> usize {
    5
}

fn default_alpha() -> f64 {
    0.05
}

impl Default for DriftPolicy {
    fn default() -> Self {
        Self {
            min_points: default_min_points(),
            alpha: default_alpha(),
            criterion: DriftCriterion::default(),
        }
    }
}

impl DriftPolicy {
    pub fn validate(&self) -> Result<(), InvalidDriftPolicy> {
        if self.min_points < MIN_DISTINCT_TIMESTAMPS {
            return Err(InvalidDriftPolicy(format!(
                "min_points must be at least {MIN_DISTINCT_TIMESTAMPS}, got {}",
                self.min_points
            )));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(InvalidDriftPolicy(format!(
                "alpha must be between 0 and 1 (exclusive), got {}",
                self.alpha
            )));
        }
        match self.criterion {
            DriftCriterion::ProjectedBreach => {}
            DriftCriterion::SlopeFraction { fraction } => {
                if !(fraction.is_finite() && fraction > 0.0) {
                    return Err(InvalidDriftPolicy(format!(
                        "slope_fraction.fraction must be positive, got {fraction}"
                    )));
                }
            }
            DriftCriterion::AbsoluteSlope { max_per_day } => {
                if !(max_per_day.is_finite() && max_per_day > 0.0) {
                    return Err(InvalidDriftPolicy(format!(
                        "absolute_slope.max_per_day must be positive, got {max_per_day}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One reading on the time axis of a series.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// Whether the reading carried a PASS/FAIL verdict when it was audited.
    pub has_verdict: bool,
}

impl SeriesPoint {
    pub fn from_record(record: &AuditRecord) -> Option<Self> {
        Some(Self {
            timestamp: record.timestamp?,
            value: record.value?,
            has_verdict: record.status.has_verdict(),
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct DriftDetector {
    policy: DriftPolicy,
}

impl DriftDetector {
    pub fn new(policy: DriftPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DriftPolicy {
        &self.policy
    }

    /// Assesses one `(machine, metric)` history. Records belonging to other
    /// pairs are ignored so series are never mixed.
    pub fn assess(
        &self,
        machine_id: &str,
        metric_name: &str,
        series: &[AuditRecord],
        rule: Option<&ToleranceRule>,
    ) -> DriftAssessment {
        let points: Vec<SeriesPoint> = series
            .iter()
            .filter(|record| record.machine_id == machine_id && record.metric_name == metric_name)
            .filter_map(SeriesPoint::from_record)
            .collect();
        assess_points(machine_id, metric_name, &points, rule, &self.policy)
    }
}

/// Pure drift assessment of `points` against `rule` under `policy`.
pub fn assess_points(
    machine_id: &str,
    metric_name: &str,
    points: &[SeriesPoint],
    rule: Option<&ToleranceRule>,
    policy: &DriftPolicy,
) -> DriftAssessment {
    let mut ordered = points.to_vec();
    ordered.sort_by_key(|point| point.timestamp);

    let mut assessment = DriftAssessment {
        machine_id: machine_id.to_string(),
        metric_name: metric_name.to_string(),
        points: ordered.len(),
        slope: 0.0,
        intercept: 0.0,
        significance: None,
        r_squared: None,
        projected_next: None,
        verdict: DriftVerdict::InsufficientData,
        flagged: false,
    };

    // Without a rule every reading is UNCHECKED, so all of them count.
    let usable = match rule {
        Some(_) => ordered.iter().filter(|point| point.has_verdict).count(),
        None => ordered.len(),
    };
    let distinct = distinct_timestamps(&ordered);
    if usable < policy.min_points || distinct < MIN_DISTINCT_TIMESTAMPS {
        return assessment;
    }

    let Some(origin) = ordered.first().map(|point| point.timestamp) else {
        return assessment;
    };
    let xs: Vec<f64> = ordered
        .iter()
        .map(|point| elapsed_days(origin, point.timestamp))
        .collect();
    let ys: Vec<f64> = ordered.iter().map(|point| point.value).collect();

    let Some(fit) = regression::fit(&xs, &ys) else {
        return assessment;
    };

    let last_x = xs.last().copied().unwrap_or_default();
    let projected_next = fit.predict(last_x + expected_interval(&xs));

    assessment.slope = fit.slope;
    assessment.intercept = fit.intercept;
    assessment.significance = Some(fit.p_value);
    assessment.r_squared = fit.r_squared;
    assessment.projected_next = Some(projected_next);

    assessment.verdict = match rule {
        None => DriftVerdict::NoRule,
        Some(_) if fit.p_value >= policy.alpha => DriftVerdict::NotSignificant,
        Some(rule) => {
            if criterion_met(&policy.criterion, fit.slope, projected_next, rule) {
                DriftVerdict::Drift
            } else {
                DriftVerdict::WithinTolerance
            }
        }
    };
    assessment.flagged = assessment.verdict == DriftVerdict::Drift;
    assessment
}

fn criterion_met(
    criterion: &DriftCriterion,
    slope: f64,
    projected_next: f64,
    rule: &ToleranceRule,
) -> bool {
    match criterion {
        DriftCriterion::ProjectedBreach => !rule.contains(projected_next),
        DriftCriterion::SlopeFraction { fraction } => slope.abs() > fraction * rule.window_width(),
        DriftCriterion::AbsoluteSlope { max_per_day } => slope.abs() > *max_per_day,
    }
}

fn elapsed_days(origin: DateTime<Utc>, timestamp: DateTime<Utc>) -> f64 {
    (timestamp - origin).num_milliseconds() as f64 / 1_000.0 / SECONDS_PER_DAY
}

fn distinct_timestamps(ordered: &[SeriesPoint]) -> usize {
    let mut count = 0;
    let mut previous = None;
    for point in ordered {
        if previous != Some(point.timestamp) {
            count += 1;
            previous = Some(point.timestamp);
        }
    }
    count
}

/// Median gap, in days, between consecutive distinct readings.
fn expected_interval(sorted_xs: &[f64]) -> f64 {
    let mut gaps: Vec<f64> = sorted_xs
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .filter(|gap| *gap > 0.0)
        .collect();
    if gaps.is_empty() {
        return 0.0;
    }
    gaps.sort_by(f64::total_cmp);
    let mid = gaps.len() / 2;
    if gaps.len() % 2 == 0 {
        (gaps[mid - 1] + gaps[mid]) / 2.0
    } else {
        gaps[mid]
    }
}
