use chrono::{Duration, TimeZone, Utc};
use qc_history::{HistoryStore, PersistenceError, SqliteHistoryStore};
use qc_protocol::{AuditRecord, QcStatus, ToleranceRule};

fn dose_rule() -> ToleranceRule {
    ToleranceRule {
        machine_id: "Linac_1".to_string(),
        metric_name: "Dose_Output".to_string(),
        target: 100.0,
        tolerance_abs: 2.0,
        unit: "cGy".to_string(),
    }
}

fn audited(day: i64, value: f64, status: QcStatus) -> AuditRecord {
    let start = Utc.with_ymd_and_hms(2023, 1, 1, 7, 30, 0).unwrap();
    AuditRecord {
        machine_id: "Linac_1".to_string(),
        metric_name: "Dose_Output".to_string(),
        timestamp: Some(start + Duration::days(day)),
        value: Some(value),
        rule_used: Some(dose_rule()),
        lower_limit: Some(98.0),
        upper_limit: Some(102.0),
        status,
        annotation: None,
    }
}

#[test]
fn history_survives_reopening_the_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("qc_history.db");

    {
        let store = SqliteHistoryStore::open(&path).expect("open");
        store
            .append(&audited(0, 100.1, QcStatus::Pass))
            .expect("append");
        store
            .append(&audited(1, 104.5, QcStatus::Fail))
            .expect("append");
    }

    let store = SqliteHistoryStore::open(&path).expect("reopen");
    store
        .append(&audited(2, 99.8, QcStatus::Pass))
        .expect("append");

    let series = store.query("Linac_1", "Dose_Output").expect("query");
    assert_eq!(series.len(), 3);
    assert_eq!(series[1], audited(1, 104.5, QcStatus::Fail));
    assert_eq!(store.record_count().expect("count"), 3);
    assert_eq!(store.location(), Some(path.as_path()));
}

#[test]
fn query_orders_by_timestamp_not_insertion() {
    let store = SqliteHistoryStore::open_in_memory().expect("open");
    store
        .append(&audited(5, 100.5, QcStatus::Pass))
        .expect("append");
    store
        .append(&audited(1, 100.1, QcStatus::Pass))
        .expect("append");
    store
        .append(&audited(3, 100.3, QcStatus::Pass))
        .expect("append");

    let values: Vec<f64> = store
        .query("Linac_1", "Dose_Output")
        .expect("query")
        .iter()
        .filter_map(|record| record.value)
        .collect();
    assert_eq!(values, vec![100.1, 100.3, 100.5]);
}

#[test]
fn unchecked_records_round_trip_without_rule() {
    let store = SqliteHistoryStore::open_in_memory().expect("open");
    let record = AuditRecord {
        machine_id: "CT_Scanner_A".to_string(),
        metric_name: "Water_HU".to_string(),
        timestamp: Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()),
        value: Some(0.4),
        rule_used: None,
        lower_limit: None,
        upper_limit: None,
        status: QcStatus::Unchecked,
        annotation: Some("no tolerance rule configured".to_string()),
    };
    store.append(&record).expect("append");

    let series = store.query("CT_Scanner_A", "Water_HU").expect("query");
    assert_eq!(series, vec![record]);
    assert!(store
        .query("CT_Scanner_A", "Other")
        .expect("query")
        .is_empty());
}

#[test]
fn series_keys_list_each_pair_once() {
    let store = SqliteHistoryStore::open_in_memory().expect("open");
    store
        .append(&audited(0, 100.0, QcStatus::Pass))
        .expect("append");
    store
        .append(&audited(1, 100.0, QcStatus::Pass))
        .expect("append");

    assert_eq!(
        store.series_keys().expect("keys"),
        vec![("Linac_1".to_string(), "Dose_Output".to_string())]
    );
}

#[test]
fn rejected_rows_are_refused() {
    let store = SqliteHistoryStore::open_in_memory().expect("open");
    let mut record = audited(0, 100.0, QcStatus::Unchecked);
    record.timestamp = None;

    assert!(matches!(
        store.append(&record),
        Err(PersistenceError::InvalidRecord(_))
    ));
    assert_eq!(store.record_count().expect("count"), 0);
}

#[test]
fn unopenable_path_is_an_open_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("missing-dir").join("history.db");

    assert!(matches!(
        SqliteHistoryStore::open(&path),
        Err(PersistenceError::Open(_))
    ));
}

#[test]
fn foreign_qc_records_table_is_refused_at_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("legacy.db");
    {
        let conn = rusqlite::Connection::open(&path).expect("legacy db");
        conn.execute_batch(
            "CREATE TABLE qc_records (Date TEXT, Machine_ID TEXT, Metric TEXT, Value REAL, QC_Status TEXT);
             INSERT INTO qc_records VALUES ('2023-01-01', 'Linac_1', 'Dose_Output', 100.2, 'PASS');",
        )
        .expect("legacy schema");
    }

    match SqliteHistoryStore::open(&path) {
        Err(PersistenceError::Open(message)) => {
            assert!(message.contains("not a QC history table"), "{message}");
            assert!(message.contains("ts_millis"), "{message}");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("legacy table was accepted"),
    }
}
