//! Shared record types for tolerance rules, measurements, audit records, and drift results.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `(machine_id, metric_name)`; the unit every series and rule is keyed by.
pub type SeriesKey = (String, String);

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum QcStatus {
    Pass,
    Fail,
    Unchecked,
}

impl QcStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Unchecked => "UNCHECKED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PASS" => Some(Self::Pass),
            "FAIL" => Some(Self::Fail),
            "UNCHECKED" => Some(Self::Unchecked),
            _ => None,
        }
    }

    /// PASS and FAIL carry a compliance verdict; UNCHECKED does not.
    pub fn has_verdict(self) -> bool {
        !matches!(self, Self::Unchecked)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToleranceRule {
    pub machine_id: String,
    pub metric_name: String,
    pub target: f64,
    pub tolerance_abs: f64,
    pub unit: String,
}

impl ToleranceRule {
    pub fn lower_limit(&self) -> f64 {
        self.target - self.tolerance_abs
    }

    pub fn upper_limit(&self) -> f64 {
        self.target + self.tolerance_abs
    }

    /// Inclusive on both bounds.
    pub fn contains(&self, value: f64) -> bool {
        self.lower_limit() <= value && value <= self.upper_limit()
    }

    pub fn window_width(&self) -> f64 {
        self.upper_limit() - self.lower_limit()
    }
}

/// A value cell as it arrives from a log source: spreadsheets and JSON emit
/// numbers, CSV and hand-edited logs emit text.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

/// One unvalidated input row.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MeasurementRow {
    #[serde(default, alias = "Machine_ID", alias = "machine")]
    pub machine_id: Option<String>,
    #[serde(default, alias = "Metric", alias = "metric")]
    pub metric_name: Option<String>,
    #[serde(default, alias = "Date", alias = "date")]
    pub timestamp: Option<String>,
    #[serde(default, alias = "Value")]
    pub value: Option<RawValue>,
    /// Set by readers when the row itself could not be decoded.
    #[serde(skip)]
    pub parse_error: Option<String>,
}

impl MeasurementRow {
    pub fn new(machine_id: &str, metric_name: &str, timestamp: &str, value: f64) -> Self {
        Self {
            machine_id: Some(machine_id.to_string()),
            metric_name: Some(metric_name.to_string()),
            timestamp: Some(timestamp.to_string()),
            value: Some(RawValue::Number(value)),
            parse_error: None,
        }
    }

    pub fn unparseable(reason: impl Into<String>) -> Self {
        Self {
            parse_error: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RecordError {
    #[error("row could not be parsed: {0}")]
    Unparseable(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("value `{0}` is not numeric")]
    NonNumericValue(String),
    #[error("value {0} is not finite")]
    NonFiniteValue(f64),
    #[error("timestamp `{0}` is not a recognised date")]
    InvalidTimestamp(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Measurement {
    pub machine_id: String,
    pub metric_name: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Measurement {
    pub fn key(&self) -> SeriesKey {
        (self.machine_id.clone(), self.metric_name.clone())
    }
}

impl TryFrom<&MeasurementRow> for Measurement {
    type Error = RecordError;

    fn try_from(row: &MeasurementRow) -> Result<Self, Self::Error> {
        if let Some(reason) = &row.parse_error {
            return Err(RecordError::Unparseable(reason.clone()));
        }

        let machine_id = required_text(row.machine_id.as_deref(), "machine_id")?;
        let metric_name = required_text(row.metric_name.as_deref(), "metric_name")?;
        let raw_timestamp = required_text(row.timestamp.as_deref(), "timestamp")?;
        let timestamp = parse_timestamp(&raw_timestamp)
            .ok_or_else(|| RecordError::InvalidTimestamp(raw_timestamp.clone()))?;

        let value = match &row.value {
            None => return Err(RecordError::MissingField("value")),
            Some(RawValue::Number(number)) => *number,
            Some(RawValue::Text(text)) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return Err(RecordError::MissingField("value"));
                }
                trimmed
                    .parse::<f64>()
                    .map_err(|_| RecordError::NonNumericValue(trimmed.to_string()))?
            }
        };
        if !value.is_finite() {
            return Err(RecordError::NonFiniteValue(value));
        }

        Ok(Self {
            machine_id,
            metric_name,
            timestamp,
            value,
        })
    }
}

fn required_text(value: Option<&str>, field: &'static str) -> Result<String, RecordError> {
    match value.map(str::trim) {
        Some(text) if !text.is_empty() => Ok(text.to_string()),
        _ => Err(RecordError::MissingField(field)),
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` and bare
/// dates. Naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// The outcome of auditing one input row. Immutable once built.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub machine_id: String,
    pub metric_name: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub value: Option<f64>,
    pub rule_used: Option<ToleranceRule>,
    pub lower_limit: Option<f64>,
    pub upper_limit: Option<f64>,
    pub status: QcStatus,
    #[serde(default)]
    pub annotation: Option<String>,
}

impl AuditRecord {
    pub fn key(&self) -> SeriesKey {
        (self.machine_id.clone(), self.metric_name.clone())
    }

    /// The validated measurement behind this record; `None` for rejected rows.
    pub fn measurement(&self) -> Option<Measurement> {
        Some(Measurement {
            machine_id: self.machine_id.clone(),
            metric_name: self.metric_name.clone(),
            timestamp: self.timestamp?,
            value: self.value?,
        })
    }

    pub fn deviation(&self) -> Option<f64> {
        let rule = self.rule_used.as_ref()?;
        Some((self.value? - rule.target).abs())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriftVerdict {
    InsufficientData,
    NoRule,
    NotSignificant,
    WithinTolerance,
    Drift,
}

impl DriftVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientData => "insufficient_data",
            Self::NoRule => "no_rule",
            Self::NotSignificant => "not_significant",
            Self::WithinTolerance => "within_tolerance",
            Self::Drift => "drift",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DriftAssessment {
    pub machine_id: String,
    pub metric_name: String,
    pub points: usize,
    /// Value units per day.
    pub slope: f64,
    pub intercept: f64,
    /// Two-sided p-value of the slope; `None` when no trend was fitted.
    pub significance: Option<f64>,
    pub r_squared: Option<f64>,
    pub projected_next: Option<f64>,
    pub verdict: DriftVerdict,
    pub flagged: bool,
}

impl DriftAssessment {
    pub fn key(&self) -> SeriesKey {
        (self.machine_id.clone(), self.metric_name.clone())
    }
}
