//! Audit engine: tolerance evaluation, history accumulation and drift review.

pub mod evaluator;
pub mod orchestrator;

use qc_history::PersistenceError;
use qc_protocol::{AuditRecord, DriftAssessment, QcStatus, SeriesKey};
use qc_rules::RuleError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use evaluator::{evaluate, reject};
pub use orchestrator::AuditOrchestrator;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("rule lookup failure: {0}")]
    Rules(String),
    #[error("history failure: {0}")]
    History(String),
}

impl From<RuleError> for AuditError {
    fn from(value: RuleError) -> Self {
        AuditError::Rules(value.to_string())
    }
}

impl From<PersistenceError> for AuditError {
    fn from(value: PersistenceError) -> Self {
        AuditError::History(value.to_string())
    }
}

pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub total: usize,
    pub pass: usize,
    pub fail: usize,
    /// Includes rejected rows.
    pub unchecked: usize,
    pub rejected: usize,
    pub series_assessed: usize,
    pub flagged: Vec<SeriesKey>,
}

impl RunSummary {
    pub fn tally(records: &[AuditRecord], drift: &[DriftAssessment]) -> Self {
        let mut summary = Self {
            total: records.len(),
            series_assessed: drift.len(),
            ..Self::default()
        };
        for record in records {
            match record.status {
                QcStatus::Pass => summary.pass += 1,
                QcStatus::Fail => summary.fail += 1,
                QcStatus::Unchecked => {
                    summary.unchecked += 1;
                    if record.value.is_none() {
                        summary.rejected += 1;
                    }
                }
            }
        }
        summary.flagged = drift
            .iter()
            .filter(|assessment| assessment.flagged)
            .map(DriftAssessment::key)
            .collect();
        summary
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuditReport {
    pub records: Vec<AuditRecord>,
    pub drift: Vec<DriftAssessment>,
    pub summary: RunSummary,
    /// False when the run aborted; some records may already be committed.
    pub complete: bool,
}

impl AuditReport {
    pub fn flagged(&self) -> impl Iterator<Item = &DriftAssessment> {
        self.drift.iter().filter(|assessment| assessment.flagged)
    }
}

/// A run that hit a fatal rule or history failure, with what it had produced.
#[derive(Debug, Error)]
#[error("audit run incomplete after {} records: {error}", .partial.records.len())]
pub struct IncompleteRun {
    #[source]
    pub error: AuditError,
    pub partial: AuditReport,
}
