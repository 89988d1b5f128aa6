//! Single-record tolerance checks. Pure: nothing here touches history.

use qc_protocol::{AuditRecord, Measurement, MeasurementRow, QcStatus, RecordError, ToleranceRule};

pub const NO_RULE_ANNOTATION: &str = "no tolerance rule configured";

pub fn evaluate(measurement: Measurement, rule: Option<&ToleranceRule>) -> AuditRecord {
    let Some(rule) = rule else {
        return AuditRecord {
            machine_id: measurement.machine_id,
            metric_name: measurement.metric_name,
            timestamp: Some(measurement.timestamp),
            value: Some(measurement.value),
            rule_used: None,
            lower_limit: None,
            upper_limit: None,
            status: QcStatus::Unchecked,
            annotation: Some(NO_RULE_ANNOTATION.to_string()),
        };
    };

    let status = if rule.contains(measurement.value) {
        QcStatus::Pass
    } else {
        QcStatus::Fail
    };
    let annotation = (status == QcStatus::Fail).then(|| {
        format!(
            "deviation {:.2} {} exceeds tolerance {:.2}",
            (measurement.value - rule.target).abs(),
            rule.unit,
            rule.tolerance_abs
        )
    });

    AuditRecord {
        machine_id: measurement.machine_id,
        metric_name: measurement.metric_name,
        timestamp: Some(measurement.timestamp),
        value: Some(measurement.value),
        rule_used: Some(rule.clone()),
        lower_limit: Some(rule.lower_limit()),
        upper_limit: Some(rule.upper_limit()),
        status,
        annotation,
    }
}

/// UNCHECKED record for a row that never became a measurement. Keeps
/// whatever identifying fields the row carried.
pub fn reject(row: &MeasurementRow, error: &RecordError) -> AuditRecord {
    AuditRecord {
        machine_id: row.machine_id.clone().unwrap_or_default(),
        metric_name: row.metric_name.clone().unwrap_or_default(),
        timestamp: row
            .timestamp
            .as_deref()
            .and_then(qc_protocol::parse_timestamp),
        value: None,
        rule_used: None,
        lower_limit: None,
        upper_limit: None,
        status: QcStatus::Unchecked,
        annotation: Some(error.to_string()),
    }
}
