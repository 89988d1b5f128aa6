//! SQLite-backed history that survives process restarts.

use std::path::{Path, PathBuf};

use chrono::DateTime;
use qc_protocol::{AuditRecord, QcStatus, SeriesKey, ToleranceRule};
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::{ensure_storable, HistoryResult, HistoryStore, PersistenceError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS qc_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  machine_id TEXT NOT NULL,
  metric TEXT NOT NULL,
  ts_millis INTEGER NOT NULL,
  value REAL NOT NULL,
  qc_status TEXT NOT NULL,
  target REAL,
  tolerance_abs REAL,
  unit TEXT,
  lower_limit REAL,
  upper_limit REAL,
  annotation TEXT,
  audit_timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
";

const INDEXES: &str = "
CREATE INDEX IF NOT EXISTS idx_qc_records_series
  ON qc_records(machine_id, metric, ts_millis, id);
";

/// Columns reads and appends depend on. A pre-existing `qc_records` table
/// lacking any of them belongs to something else.
const REQUIRED_COLUMNS: [&str; 11] = [
    "machine_id",
    "metric",
    "ts_millis",
    "value",
    "qc_status",
    "target",
    "tolerance_abs",
    "unit",
    "lower_limit",
    "upper_limit",
    "annotation",
];

pub struct SqliteHistoryStore {
    conn: Connection,
    location: Option<PathBuf>,
}

struct StoredRow {
    machine_id: String,
    metric: String,
    ts_millis: i64,
    value: f64,
    qc_status: String,
    target: Option<f64>,
    tolerance_abs: Option<f64>,
    unit: Option<String>,
    lower_limit: Option<f64>,
    upper_limit: Option<f64>,
    annotation: Option<String>,
}

impl SqliteHistoryStore {
    pub fn open(path: &Path) -> HistoryResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| PersistenceError::Open(format!("{}: {e}", path.display())))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| PersistenceError::Open(format!("failed to configure sqlite pragmas: {e}")))?;

        let store = Self {
            conn,
            location: Some(path.to_path_buf()),
        };
        store.migrate()?;
        info!(path = %path.display(), "history database ready");
        Ok(store)
    }

    pub fn open_in_memory() -> HistoryResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PersistenceError::Open(format!("in-memory database: {e}")))?;
        let store = Self {
            conn,
            location: None,
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    pub fn record_count(&self) -> HistoryResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM qc_records", [], |row| row.get(0))
            .map_err(|e| PersistenceError::Read(e.to_string()))?;
        u64::try_from(count).map_err(|_| PersistenceError::Corrupt(format!("row count {count}")))
    }

    fn migrate(&self) -> HistoryResult<()> {
        self.conn
            .execute_batch(SCHEMA)
            .map_err(|e| PersistenceError::Open(format!("failed to apply history schema: {e}")))?;
        self.check_columns()?;
        self.conn
            .execute_batch(INDEXES)
            .map_err(|e| PersistenceError::Open(format!("failed to apply history schema: {e}")))
    }

    fn check_columns(&self) -> HistoryResult<()> {
        let read_err = |e: rusqlite::Error| {
            PersistenceError::Open(format!("failed to inspect qc_records columns: {e}"))
        };
        let mut stmt = self
            .conn
            .prepare("PRAGMA table_info(qc_records)")
            .map_err(read_err)?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(read_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(read_err)?;

        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|required| {
                !columns
                    .iter()
                    .any(|column| column.eq_ignore_ascii_case(required))
            })
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let location = self
            .location
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| ":memory:".to_string());
        Err(PersistenceError::Open(format!(
            "{location}: existing qc_records table is not a QC history table (missing columns: {})",
            missing.join(", ")
        )))
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn append(&self, record: &AuditRecord) -> HistoryResult<()> {
        ensure_storable(record)?;
        let (Some(timestamp), Some(value)) = (record.timestamp, record.value) else {
            return Err(PersistenceError::InvalidRecord(
                "record has no timestamp or value".to_string(),
            ));
        };
        let rule = record.rule_used.as_ref();

        self.conn
            .execute(
                "INSERT INTO qc_records(
                    machine_id, metric, ts_millis, value, qc_status,
                    target, tolerance_abs, unit, lower_limit, upper_limit, annotation
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.machine_id,
                    record.metric_name,
                    timestamp.timestamp_millis(),
                    value,
                    record.status.as_str(),
                    rule.map(|rule| rule.target),
                    rule.map(|rule| rule.tolerance_abs),
                    rule.map(|rule| rule.unit.as_str()),
                    record.lower_limit,
                    record.upper_limit,
                    record.annotation,
                ],
            )
            .map_err(|e| PersistenceError::Write(e.to_string()))?;

        debug!(
            machine = %record.machine_id,
            metric = %record.metric_name,
            status = record.status.as_str(),
            "history record appended"
        );
        Ok(())
    }

    fn query(&self, machine_id: &str, metric_name: &str) -> HistoryResult<Vec<AuditRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT machine_id, metric, ts_millis, value, qc_status,
                        target, tolerance_abs, unit, lower_limit, upper_limit, annotation
                 FROM qc_records
                 WHERE machine_id = ?1 AND metric = ?2
                 ORDER BY ts_millis ASC, id ASC",
            )
            .map_err(|e| PersistenceError::Read(e.to_string()))?;

        let rows = stmt
            .query_map(params![machine_id, metric_name], |row| {
                Ok(StoredRow {
                    machine_id: row.get(0)?,
                    metric: row.get(1)?,
                    ts_millis: row.get(2)?,
                    value: row.get(3)?,
                    qc_status: row.get(4)?,
                    target: row.get(5)?,
                    tolerance_abs: row.get(6)?,
                    unit: row.get(7)?,
                    lower_limit: row.get(8)?,
                    upper_limit: row.get(9)?,
                    annotation: row.get(10)?,
                })
            })
            .map_err(|e| PersistenceError::Read(e.to_string()))?;

        let mut series = Vec::new();
        for row in rows {
            let row = row.map_err(|e| PersistenceError::Read(e.to_string()))?;
            series.push(row.into_record()?);
        }
        Ok(series)
    }

    fn series_keys(&self) -> HistoryResult<Vec<SeriesKey>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT machine_id, metric FROM qc_records ORDER BY machine_id, metric",
            )
            .map_err(|e| PersistenceError::Read(e.to_string()))?;
        let keys = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| PersistenceError::Read(e.to_string()))?
            .collect::<Result<Vec<SeriesKey>, _>>()
            .map_err(|e| PersistenceError::Read(e.to_string()))?;
        Ok(keys)
    }
}

impl StoredRow {
    fn into_record(self) -> HistoryResult<AuditRecord> {
        let status = QcStatus::parse(&self.qc_status).ok_or_else(|| {
            PersistenceError::Corrupt(format!("unknown qc_status `{}`", self.qc_status))
        })?;
        let timestamp = DateTime::from_timestamp_millis(self.ts_millis).ok_or_else(|| {
            PersistenceError::Corrupt(format!("timestamp out of range: {}", self.ts_millis))
        })?;

        let rule_used = match (self.target, self.tolerance_abs, self.unit) {
            (Some(target), Some(tolerance_abs), Some(unit)) => Some(ToleranceRule {
                machine_id: self.machine_id.clone(),
                metric_name: self.metric.clone(),
                target,
                tolerance_abs,
                unit,
            }),
            _ => None,
        };

        Ok(AuditRecord {
            machine_id: self.machine_id,
            metric_name: self.metric,
            timestamp: Some(timestamp),
            value: Some(self.value),
            rule_used,
            lower_limit: self.lower_limit,
            upper_limit: self.upper_limit,
            status,
            annotation: self.annotation,
        })
    }
}
