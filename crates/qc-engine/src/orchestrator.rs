use std::collections::HashSet;

use qc_drift::DriftDetector;
use qc_history::HistoryStore;
use qc_protocol::{AuditRecord, DriftAssessment, Measurement, MeasurementRow, QcStatus, SeriesKey};
use qc_rules::RuleStore;
use tracing::{debug, error, info, warn};

use crate::evaluator;
use crate::{AuditError, AuditReport, AuditResult, IncompleteRun, RunSummary};

pub struct AuditOrchestrator<R, H>
where
    R: RuleStore,
    H: HistoryStore,
{
    rules: R,
    history: H,
    detector: DriftDetector,
}

impl<R, H> AuditOrchestrator<R, H>
where
    R: RuleStore,
    H: HistoryStore,
{
    pub fn new(rules: R, history: H, detector: DriftDetector) -> Self {
        Self {
            rules,
            history,
            detector,
        }
    }

    pub fn rules(&self) -> &R {
        &self.rules
    }

    pub fn history(&self) -> &H {
        &self.history
    }

    pub fn detector(&self) -> &DriftDetector {
        &self.detector
    }

    /// Audits `rows` in input order, then assesses drift once per series the
    /// batch touched. Malformed rows become UNCHECKED records; rule or history
    /// failures abort the run.
    pub fn run(&self, rows: &[MeasurementRow]) -> Result<AuditReport, IncompleteRun> {
        info!(rows = rows.len(), "audit run started");

        let mut records = Vec::with_capacity(rows.len());
        let mut touched: Vec<SeriesKey> = Vec::new();
        let mut seen: HashSet<SeriesKey> = HashSet::new();

        for (index, row) in rows.iter().enumerate() {
            let measurement = match Measurement::try_from(row) {
                Ok(measurement) => measurement,
                Err(err) => {
                    warn!(row = index + 1, error = %err, "measurement rejected");
                    if let Some(key) = row_key(row) {
                        if seen.insert(key.clone()) {
                            touched.push(key);
                        }
                    }
                    records.push(evaluator::reject(row, &err));
                    continue;
                }
            };

            let key = measurement.key();
            let record = match self.audit_measurement(measurement) {
                Ok(record) => record,
                Err(err) => return Err(abort(err, records, Vec::new())),
            };

            if seen.insert(key.clone()) {
                if record.status == QcStatus::Unchecked {
                    warn!(machine = %key.0, metric = %key.1, "configuration missing for series");
                }
                touched.push(key);
            }
            records.push(record);
        }

        let mut drift = Vec::with_capacity(touched.len());
        for (machine_id, metric_name) in &touched {
            match self.assess_series(machine_id, metric_name) {
                Ok(assessment) => drift.push(assessment),
                Err(err) => return Err(abort(err, records, drift)),
            }
        }

        let summary = RunSummary::tally(&records, &drift);
        info!(
            total = summary.total,
            pass = summary.pass,
            fail = summary.fail,
            unchecked = summary.unchecked,
            flagged = summary.flagged.len(),
            "audit run complete"
        );

        Ok(AuditReport {
            records,
            drift,
            summary,
            complete: true,
        })
    }

    /// Reassesses one series from whatever history currently holds.
    pub fn assess_series(
        &self,
        machine_id: &str,
        metric_name: &str,
    ) -> AuditResult<DriftAssessment> {
        let rule = self.rules.lookup(machine_id, metric_name)?;
        let series = self.history.query(machine_id, metric_name)?;
        let assessment = self
            .detector
            .assess(machine_id, metric_name, &series, rule.as_ref());

        if assessment.flagged {
            warn!(
                machine = machine_id,
                metric = metric_name,
                slope_per_day = assessment.slope,
                p_value = assessment.significance,
                "significant drift detected"
            );
        } else {
            debug!(
                machine = machine_id,
                metric = metric_name,
                verdict = assessment.verdict.as_str(),
                points = assessment.points,
                "drift assessed"
            );
        }
        Ok(assessment)
    }

    fn audit_measurement(&self, measurement: Measurement) -> AuditResult<AuditRecord> {
        let rule = self
            .rules
            .lookup(&measurement.machine_id, &measurement.metric_name)?;
        let record = evaluator::evaluate(measurement, rule.as_ref());
        self.history.append(&record)?;
        debug!(
            machine = %record.machine_id,
            metric = %record.metric_name,
            status = record.status.as_str(),
            "measurement audited"
        );
        Ok(record)
    }
}

/// The series a rejected row still names, when it carries both identifiers.
fn row_key(row: &MeasurementRow) -> Option<SeriesKey> {
    let machine_id = row.machine_id.as_deref().map(str::trim).filter(|id| !id.is_empty())?;
    let metric_name = row.metric_name.as_deref().map(str::trim).filter(|id| !id.is_empty())?;
    Some((machine_id.to_string(), metric_name.to_string()))
}

fn abort(
    err: AuditError,
    records: Vec<AuditRecord>,
    drift: Vec<DriftAssessment>,
) -> IncompleteRun {
    error!(error = %err, audited = records.len(), "audit run aborted");
    let summary = RunSummary::tally(&records, &drift);
    IncompleteRun {
        error: err,
        partial: AuditReport {
            records,
            drift,
            summary,
            complete: false,
        },
    }
}
