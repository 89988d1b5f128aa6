//! Report bundle writer: tabular results, drift assessments, chart series and
//! a checksum manifest over everything written.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::SecondsFormat;
use qc_engine::AuditReport;
use qc_protocol::AuditRecord;
use serde::Serialize;
use tracing::info;

use crate::chart::ChartSeries;
use crate::checksum;

pub const RESULTS_CSV: &str = "audit_results.csv";
pub const RESULTS_JSON: &str = "audit_results.json";
pub const DRIFT_JSON: &str = "drift_assessments.json";
pub const SUMMARY_JSON: &str = "summary.json";
pub const CHARTS_DIR: &str = "charts";
pub const CHECKSUMS: &str = "checksums.sha256";

const CSV_HEADER: &str = "Date,Machine_ID,Metric,Value,QC_Status,Target,Tolerance_Abs,Unit,Lower_Limit,Upper_Limit,Deviation,Annotation";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportBundle {
    pub root: PathBuf,
    /// Paths relative to `root`, in write order; excludes the checksum file.
    pub files: Vec<PathBuf>,
}

#[derive(Serialize)]
struct SummaryDocument<'a> {
    complete: bool,
    #[serde(flatten)]
    summary: &'a qc_engine::RunSummary,
}

pub fn write_report_bundle(
    out_dir: &Path,
    report: &AuditReport,
    charts: &[ChartSeries],
) -> anyhow::Result<ReportBundle> {
    fs::create_dir_all(out_dir.join(CHARTS_DIR))
        .with_context(|| format!("failed to create report directory {}", out_dir.display()))?;

    let mut files = Vec::new();

    write_file(out_dir, RESULTS_CSV, records_csv(&report.records), &mut files)?;
    write_file(out_dir, RESULTS_JSON, to_json(&report.records)?, &mut files)?;
    write_file(out_dir, DRIFT_JSON, to_json(&report.drift)?, &mut files)?;
    write_file(
        out_dir,
        SUMMARY_JSON,
        to_json(&SummaryDocument {
            complete: report.complete,
            summary: &report.summary,
        })?,
        &mut files,
    )?;

    let mut stems = BTreeSet::new();
    for chart in charts {
        let stem = unique_stem(chart.file_stem(), &mut stems);
        let relative = format!("{CHARTS_DIR}/{stem}.json");
        write_file(out_dir, &relative, to_json(chart)?, &mut files)?;
    }

    let manifest = checksum::render_manifest(&checksum::manifest_for(out_dir, &files)?);
    let manifest_path = out_dir.join(CHECKSUMS);
    fs::write(&manifest_path, manifest)
        .with_context(|| format!("failed to write manifest {}", manifest_path.display()))?;

    info!(path = %out_dir.display(), files = files.len(), "report bundle written");
    Ok(ReportBundle {
        root: out_dir.to_path_buf(),
        files,
    })
}

pub fn records_csv(records: &[AuditRecord]) -> String {
    let mut output = String::from(CSV_HEADER);
    output.push('\n');

    for record in records {
        let rule = record.rule_used.as_ref();
        let fields = [
            record
                .timestamp
                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default(),
            record.machine_id.clone(),
            record.metric_name.clone(),
            optional_number(record.value),
            record.status.as_str().to_string(),
            optional_number(rule.map(|rule| rule.target)),
            optional_number(rule.map(|rule| rule.tolerance_abs)),
            rule.map(|rule| rule.unit.clone()).unwrap_or_default(),
            optional_number(record.lower_limit),
            optional_number(record.upper_limit),
            optional_number(record.deviation()),
            record.annotation.clone().unwrap_or_default(),
        ];
        let line: Vec<String> = fields.iter().map(|field| csv_escape(field)).collect();
        output.push_str(&line.join(","));
        output.push('\n');
    }

    output
}

/// Human-readable run summary, printed at the end of an audit.
pub fn summary_text(report: &AuditReport) -> String {
    let summary = &report.summary;
    let mut lines = vec![
        "=".repeat(40),
        if report.complete {
            "       AUDIT COMPLETE       ".to_string()
        } else {
            "       AUDIT INCOMPLETE       ".to_string()
        },
        "=".repeat(40),
        format!(
            "records={} PASS={} FAIL={} UNCHECKED={} (rejected rows={})",
            summary.total, summary.pass, summary.fail, summary.unchecked, summary.rejected
        ),
        format!("series assessed={}", summary.series_assessed),
    ];

    let flagged: Vec<_> = report.flagged().collect();
    if flagged.is_empty() {
        lines.push("[OK] No significant drift detected.".to_string());
    } else {
        lines.push("[!] PREDICTIVE MAINTENANCE ALERTS FOUND:".to_string());
        for assessment in flagged {
            lines.push(format!(
                "    [{}] {}: Significant Drift detected (Slope: {:.3}/day, p={})",
                assessment.machine_id,
                assessment.metric_name,
                assessment.slope,
                assessment
                    .significance
                    .map(|p| format!("{p:.4}"))
                    .unwrap_or_else(|| "n/a".to_string())
            ));
        }
    }
    lines.push("=".repeat(40));
    lines.join("\n")
}

/// Distinct pairs can sanitize to the same stem ("Linac 1" and "Linac_1").
/// Later ones get `_2`, `_3`, ... Comparison ignores case.
fn unique_stem(stem: String, used: &mut BTreeSet<String>) -> String {
    if used.insert(stem.to_ascii_lowercase()) {
        return stem;
    }
    let mut suffix = 2;
    loop {
        let candidate = format!("{stem}_{suffix}");
        if used.insert(candidate.to_ascii_lowercase()) {
            return candidate;
        }
        suffix += 1;
    }
}

fn write_file(
    root: &Path,
    relative: &str,
    contents: String,
    written: &mut Vec<PathBuf>,
) -> anyhow::Result<()> {
    let path = root.join(relative);
    fs::write(&path, contents)
        .with_context(|| format!("failed to write report file {}", path.display()))?;
    written.push(PathBuf::from(relative));
    Ok(())
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<String> {
    let mut json = serde_json::to_string_pretty(value).context("failed to format report JSON")?;
    json.push('\n');
    Ok(json)
}

fn optional_number(value: Option<f64>) -> String {
    value.map(|number| number.to_string()).unwrap_or_default()
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
