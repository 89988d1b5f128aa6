use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use predicates::str::contains;

const CONFIG: &str = r#"
Linac_1:
  Dose_Output: { target: 100.0, tolerance_abs: 2.0, unit: cGy }
MRI_Scanner_3T:
  SNR_Coil_1: { target: 50.0, tolerance_abs: 5.0, unit: ratio }
"#;

struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("config.yaml"), CONFIG).expect("write config");
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path(name);
        fs::write(&path, contents).expect("write file");
        path
    }

    fn cmd(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("qc-cli");
        cmd.arg("--config")
            .arg(self.path("config.yaml"))
            .arg("--db")
            .arg(self.path("history.db"))
            .env_remove("RUST_LOG")
            .timeout(Duration::from_secs(10));
        cmd
    }
}

fn ramp_log(days: std::ops::Range<u32>) -> String {
    let mut log = String::from("Date,Machine_ID,Metric,Value\n");
    for day in days {
        let value = 98.0 + 3.8 * f64::from(day) / 9.0;
        log.push_str(&format!("2023-01-{:02},Linac_1,Dose_Output,{value:.3}\n", day + 1));
    }
    log
}

fn out_dir_arg(path: &Path) -> [String; 2] {
    ["--out-dir".to_string(), path.display().to_string()]
}

#[test]
fn audit_isolates_non_numeric_rows_and_exits_zero() {
    let ws = Workspace::new();
    let input = ws.write(
        "qc_log.csv",
        "Date,Machine_ID,Metric,Value\n\
         2023-01-01,Linac_1,Dose_Output,101.0\n\
         2023-01-02,Linac_1,Dose_Output,ERR\n\
         2023-01-03,Linac_1,Dose_Output,102.1\n\
         2023-01-03,CT_Scanner_A,Water_HU,1.5\n",
    );
    let out = ws.path("reports");

    ws.cmd()
        .arg("audit")
        .arg("--input")
        .arg(&input)
        .args(out_dir_arg(&out))
        .assert()
        .success()
        .stdout(contains("AUDIT COMPLETE"))
        .stdout(contains("PASS=1 FAIL=1 UNCHECKED=2"))
        .stdout(contains("No significant drift detected"));

    let csv = fs::read_to_string(out.join("audit_results.csv")).expect("results csv");
    assert!(csv.contains("UNCHECKED"));
    assert!(out.join("checksums.sha256").exists());
    assert!(out.join("charts/Linac_1__Dose_Output.json").exists());
}

#[test]
fn drift_alert_appears_once_history_accumulates() {
    let ws = Workspace::new();
    let first = ws.write("first.csv", &ramp_log(0..4));
    let second = ws.write("second.csv", &ramp_log(4..10));
    let out = ws.path("reports");

    ws.cmd()
        .arg("audit")
        .arg("--input")
        .arg(&first)
        .args(out_dir_arg(&out))
        .assert()
        .success()
        .stdout(contains("No significant drift detected"));

    ws.cmd()
        .arg("audit")
        .arg("--input")
        .arg(&second)
        .args(out_dir_arg(&out))
        .assert()
        .success()
        .stdout(contains("PREDICTIVE MAINTENANCE ALERTS FOUND"))
        .stdout(contains("[Linac_1] Dose_Output"));

    ws.cmd()
        .args(["drift", "Linac_1", "Dose_Output"])
        .assert()
        .success()
        .stdout(contains("\"flagged\": true"))
        .stdout(contains("\"points\": 10"))
        .stderr(contains("reassessing drift from stored history"));
}

#[test]
fn ephemeral_audit_leaves_no_database() {
    let ws = Workspace::new();
    let input = ws.write("qc_log.csv", &ramp_log(0..3));

    ws.cmd()
        .arg("audit")
        .arg("--input")
        .arg(&input)
        .args(out_dir_arg(&ws.path("reports")))
        .arg("--ephemeral")
        .assert()
        .success();

    assert!(!ws.path("history.db").exists());
}

#[test]
fn history_lists_stored_series() {
    let ws = Workspace::new();
    let input = ws.write(
        "qc_log.json",
        r#"[
  {"Date": "2023-01-01", "Machine_ID": "MRI_Scanner_3T", "Metric": "SNR_Coil_1", "Value": 50.2},
  {"Date": "2023-01-02", "Machine_ID": "MRI_Scanner_3T", "Metric": "SNR_Coil_1", "Value": 42.0}
]"#,
    );
    ws.cmd()
        .arg("audit")
        .arg("--input")
        .arg(&input)
        .args(out_dir_arg(&ws.path("reports")))
        .assert()
        .success();

    ws.cmd()
        .args(["history", "MRI_Scanner_3T", "SNR_Coil_1"])
        .assert()
        .success()
        .stdout(contains("MRI_Scanner_3T / SNR_Coil_1: 2 records"))
        .stdout(contains("FAIL"));

    ws.cmd()
        .args(["history", "MRI_Scanner_3T", "SNR_Coil_1", "--json"])
        .assert()
        .success()
        .stdout(contains("\"status\": \"PASS\""));

    ws.cmd()
        .arg("history")
        .assert()
        .success()
        .stdout(contains("1 stored series"))
        .stdout(contains("MRI_Scanner_3T / SNR_Coil_1"));

    ws.cmd()
        .args(["history", "MRI_Scanner_3T"])
        .assert()
        .failure()
        .stderr(contains("both a machine and a metric"));
}

#[test]
fn check_config_reports_rule_count() {
    let ws = Workspace::new();
    ws.cmd()
        .arg("check-config")
        .assert()
        .success()
        .stdout(contains("configuration ok: rules=2 machines=2"))
        .stdout(contains("Linac_1 / Dose_Output"))
        .stdout(contains("MRI_Scanner_3T / SNR_Coil_1"));
}

#[test]
fn invalid_config_fails_before_processing() {
    let ws = Workspace::new();
    ws.write(
        "config.yaml",
        "Linac_1:\n  Dose_Output: { target: 100.0, unit: cGy }\n",
    );
    let input = ws.write("qc_log.csv", &ramp_log(0..3));

    ws.cmd()
        .arg("audit")
        .arg("--input")
        .arg(&input)
        .args(out_dir_arg(&ws.path("reports")))
        .assert()
        .failure()
        .stderr(contains("tolerance_abs"));

    assert!(!ws.path("reports").exists());
}

#[test]
fn missing_input_file_fails() {
    let ws = Workspace::new();
    ws.cmd()
        .arg("audit")
        .arg("--input")
        .arg(ws.path("absent.csv"))
        .args(out_dir_arg(&ws.path("reports")))
        .assert()
        .failure()
        .stderr(contains("failed to read measurement log"));
}

#[test]
fn verify_report_detects_tampering() {
    let ws = Workspace::new();
    let input = ws.write("qc_log.csv", &ramp_log(0..3));
    let out = ws.path("reports");
    ws.cmd()
        .arg("audit")
        .arg("--input")
        .arg(&input)
        .args(out_dir_arg(&out))
        .assert()
        .success();

    ws.cmd()
        .arg("verify-report")
        .arg("--dir")
        .arg(&out)
        .assert()
        .success()
        .stdout(contains("report verified"));

    fs::write(out.join("audit_results.csv"), "edited\n").expect("tamper");
    ws.cmd()
        .arg("verify-report")
        .arg("--dir")
        .arg(&out)
        .assert()
        .failure()
        .stdout(contains("MISMATCH audit_results.csv"));
}

#[test]
fn default_logging_covers_reader_and_report_writer() {
    let ws = Workspace::new();
    let input = ws.write("qc_log.csv", &ramp_log(0..3));

    ws.cmd()
        .arg("audit")
        .arg("--input")
        .arg(&input)
        .args(out_dir_arg(&ws.path("reports")))
        .assert()
        .success()
        .stderr(contains("measurement log loaded"))
        .stderr(contains("report bundle written"));
}

#[test]
fn json_log_with_a_bad_element_still_audits_the_rest() {
    let ws = Workspace::new();
    let input = ws.write(
        "qc_log.json",
        r#"[
  {"Date": "2023-01-01", "Machine_ID": "Linac_1", "Metric": "Dose_Output", "Value": 100.4},
  {"Date": "2023-01-02", "Machine_ID": "Linac_1", "Metric": "Dose_Output", "Value": true},
  {"Date": "2023-01-03", "Machine_ID": "Linac_1", "Metric": "Dose_Output", "Value": 99.8}
]"#,
    );
    let out = ws.path("reports");

    ws.cmd()
        .arg("audit")
        .arg("--input")
        .arg(&input)
        .args(out_dir_arg(&out))
        .assert()
        .success()
        .stdout(contains("PASS=2 FAIL=0 UNCHECKED=1 (rejected rows=1)"));

    let csv = fs::read_to_string(out.join("audit_results.csv")).expect("results csv");
    assert!(csv.contains("element 2"));
}
