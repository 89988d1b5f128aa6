//! Chart-ready series: one per `(machine, metric)`, with the tolerance window
//! overlaid. Rendering is left to whatever consumes the JSON.

use chrono::{DateTime, Utc};
use qc_protocol::{AuditRecord, DriftAssessment, QcStatus, ToleranceRule};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChartPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub status: QcStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChartSeries {
    pub title: String,
    pub machine_id: String,
    pub metric_name: String,
    pub unit: Option<String>,
    pub target: Option<f64>,
    pub lower_limit: Option<f64>,
    pub upper_limit: Option<f64>,
    /// Trend line endpoints when drift was fitted: `[(first, y0), (last, y1)]`.
    pub trend: Option<[(DateTime<Utc>, f64); 2]>,
    pub points: Vec<ChartPoint>,
}

impl ChartSeries {
    /// Builds a series from a pair's full history. The overlay uses `rule`
    /// when given, else the most recent rule recorded in the history itself.
    pub fn from_history(
        machine_id: &str,
        metric_name: &str,
        history: &[AuditRecord],
        rule: Option<&ToleranceRule>,
        drift: Option<&DriftAssessment>,
    ) -> Self {
        let points: Vec<ChartPoint> = history
            .iter()
            .filter(|record| record.machine_id == machine_id && record.metric_name == metric_name)
            .filter_map(|record| {
                Some(ChartPoint {
                    timestamp: record.timestamp?,
                    value: record.value?,
                    status: record.status,
                })
            })
            .collect();

        let rule = rule.or_else(|| {
            history
                .iter()
                .rev()
                .filter(|record| record.machine_id == machine_id && record.metric_name == metric_name)
                .find_map(|record| record.rule_used.as_ref())
        });

        let trend = drift
            .filter(|assessment| assessment.significance.is_some())
            .and_then(|assessment| trend_endpoints(&points, assessment));

        Self {
            title: format!("QC Trend: {machine_id} - {metric_name}"),
            machine_id: machine_id.to_string(),
            metric_name: metric_name.to_string(),
            unit: rule.map(|rule| rule.unit.clone()),
            target: rule.map(|rule| rule.target),
            lower_limit: rule.map(ToleranceRule::lower_limit),
            upper_limit: rule.map(ToleranceRule::upper_limit),
            trend,
            points,
        }
    }

    pub fn file_stem(&self) -> String {
        format!(
            "{}__{}",
            sanitize(&self.machine_id),
            sanitize(&self.metric_name)
        )
    }
}

fn trend_endpoints(
    points: &[ChartPoint],
    assessment: &DriftAssessment,
) -> Option<[(DateTime<Utc>, f64); 2]> {
    let first = points.iter().map(|point| point.timestamp).min()?;
    let last = points.iter().map(|point| point.timestamp).max()?;
    let span_days = (last - first).num_milliseconds() as f64 / 86_400_000.0;
    Some([
        (first, assessment.intercept),
        (last, assessment.intercept + assessment.slope * span_days),
    ])
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
