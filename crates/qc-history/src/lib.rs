//! History store interface and the in-memory baseline.

pub mod sqlite;

use std::sync::Mutex;

use qc_protocol::{AuditRecord, SeriesKey};
use thiserror::Error;

pub use sqlite::SqliteHistoryStore;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("open failure: {0}")]
    Open(String),
    #[error("write failure: {0}")]
    Write(String),
    #[error("read failure: {0}")]
    Read(String),
    #[error("corrupt history row: {0}")]
    Corrupt(String),
    #[error("record cannot be stored: {0}")]
    InvalidRecord(String),
}

pub type HistoryResult<T> = Result<T, PersistenceError>;

/// Append-only record of audited measurements, queryable per series.
pub trait HistoryStore {
    fn append(&self, record: &AuditRecord) -> HistoryResult<()>;

    /// Oldest first; equal timestamps keep insertion order.
    fn query(&self, machine_id: &str, metric_name: &str) -> HistoryResult<Vec<AuditRecord>>;

    /// Every stored `(machine, metric)` pair, sorted.
    fn series_keys(&self) -> HistoryResult<Vec<SeriesKey>>;
}

impl<T: HistoryStore + ?Sized> HistoryStore for &T {
    fn append(&self, record: &AuditRecord) -> HistoryResult<()> {
        (**self).append(record)
    }

    fn query(&self, machine_id: &str, metric_name: &str) -> HistoryResult<Vec<AuditRecord>> {
        (**self).query(machine_id, metric_name)
    }

    fn series_keys(&self) -> HistoryResult<Vec<SeriesKey>> {
        (**self).series_keys()
    }
}

/// Only validated measurements belong in history; rejected rows have no
/// position on the time axis.
pub fn ensure_storable(record: &AuditRecord) -> HistoryResult<()> {
    if record.timestamp.is_none() || record.value.is_none() {
        return Err(PersistenceError::InvalidRecord(format!(
            "{}/{} has no timestamp or value",
            record.machine_id, record.metric_name
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryHistoryStore {
    pub fn with_records(records: Vec<AuditRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn append(&self, record: &AuditRecord) -> HistoryResult<()> {
        ensure_storable(record)?;
        self.records
            .lock()
            .map_err(|_| PersistenceError::Write("poisoned lock".to_string()))?
            .push(record.clone());
        Ok(())
    }

    fn query(&self, machine_id: &str, metric_name: &str) -> HistoryResult<Vec<AuditRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| PersistenceError::Read("poisoned lock".to_string()))?;
        let mut series: Vec<AuditRecord> = records
            .iter()
            .filter(|record| record.machine_id == machine_id && record.metric_name == metric_name)
            .cloned()
            .collect();
        series.sort_by_key(|record| record.timestamp);
        Ok(series)
    }

    fn series_keys(&self) -> HistoryResult<Vec<SeriesKey>> {
        let records = self
            .records
            .lock()
            .map_err(|_| PersistenceError::Read("poisoned lock".to_string()))?;
        let mut keys: Vec<SeriesKey> = records.iter().map(AuditRecord::key).collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
