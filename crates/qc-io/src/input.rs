//! Measurement log readers. The reader is picked from the file extension.

use std::fs;
use std::path::Path;

use anyhow::Context;
use qc_protocol::{MeasurementRow, RawValue};
use tracing::info;

pub fn read_measurements(path: &Path) -> anyhow::Result<Vec<MeasurementRow>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read measurement log {}", path.display()))?;

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let rows = match extension.as_str() {
        "csv" => parse_csv(&raw),
        "json" => parse_json(&raw),
        "jsonl" | "ndjson" => Ok(parse_jsonl(&raw)),
        other => anyhow::bail!(
            "unsupported measurement log format `{other}` for {} (expected csv, json, jsonl)",
            path.display()
        ),
    }
    .with_context(|| format!("failed to parse measurement log {}", path.display()))?;

    info!(path = %path.display(), rows = rows.len(), "measurement log loaded");
    Ok(rows)
}

/// A JSON array of row objects. Elements that are not valid rows are kept as
/// malformed rows; only a document that is not an array fails outright.
pub fn parse_json(raw: &str) -> anyhow::Result<Vec<MeasurementRow>> {
    let elements: Vec<serde_json::Value> =
        serde_json::from_str(raw).context("expected a JSON array of measurement rows")?;
    Ok(elements
        .into_iter()
        .enumerate()
        .map(|(idx, element)| {
            serde_json::from_value::<MeasurementRow>(element).unwrap_or_else(|err| {
                MeasurementRow::unparseable(format!("element {}: {err}", idx + 1))
            })
        })
        .collect())
}

/// One object per line. Lines that are not valid rows are kept as malformed
/// rows so the audit can report them.
pub fn parse_jsonl(raw: &str) -> Vec<MeasurementRow> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str::<MeasurementRow>(line).unwrap_or_else(|err| {
                MeasurementRow::unparseable(format!("line {}: {err}", idx + 1))
            })
        })
        .collect()
}

#[derive(Clone, Copy, Debug, Default)]
struct CsvColumns {
    timestamp: Option<usize>,
    machine_id: Option<usize>,
    metric_name: Option<usize>,
    value: Option<usize>,
}

/// Header-driven CSV: `Date,Machine_ID,Metric,Value` in any order and case.
/// Quoted fields may contain commas and `""` escapes but not line breaks.
pub fn parse_csv(raw: &str) -> anyhow::Result<Vec<MeasurementRow>> {
    let mut lines = raw
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let Some((_, header)) = lines.next() else {
        return Ok(Vec::new());
    };
    let header = split_csv_line(header.trim_start_matches('\u{feff}'))
        .map_err(|reason| anyhow::anyhow!("invalid CSV header: {reason}"))?;
    let columns = resolve_columns(&header)?;

    let mut rows = Vec::new();
    for (idx, line) in lines {
        let line_no = idx + 1;
        let fields = match split_csv_line(line) {
            Ok(fields) => fields,
            Err(reason) => {
                rows.push(MeasurementRow::unparseable(format!("line {line_no}: {reason}")));
                continue;
            }
        };
        if fields.len() != header.len() {
            rows.push(MeasurementRow::unparseable(format!(
                "line {line_no}: expected {} fields, found {}",
                header.len(),
                fields.len()
            )));
            continue;
        }

        let cell = |column: Option<usize>| {
            column
                .and_then(|index| fields.get(index))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        rows.push(MeasurementRow {
            machine_id: cell(columns.machine_id),
            metric_name: cell(columns.metric_name),
            timestamp: cell(columns.timestamp),
            value: cell(columns.value).map(RawValue::Text),
            parse_error: None,
        });
    }

    Ok(rows)
}

fn resolve_columns(header: &[String]) -> anyhow::Result<CsvColumns> {
    let mut columns = CsvColumns::default();
    for (index, name) in header.iter().enumerate() {
        match name.trim().to_ascii_lowercase().as_str() {
            "date" | "timestamp" => columns.timestamp = Some(index),
            "machine_id" | "machine" => columns.machine_id = Some(index),
            "metric" | "metric_name" => columns.metric_name = Some(index),
            "value" => columns.value = Some(index),
            _ => {}
        }
    }

    let missing: Vec<&str> = [
        ("date", columns.timestamp),
        ("machine_id", columns.machine_id),
        ("metric", columns.metric_name),
        ("value", columns.value),
    ]
    .into_iter()
    .filter(|(_, column)| column.is_none())
    .map(|(name, _)| name)
    .collect();
    if !missing.is_empty() {
        anyhow::bail!("CSV header is missing columns: {}", missing.join(", "));
    }

    Ok(columns)
}

fn split_csv_line(line: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if current.trim().is_empty() => {
                current.clear();
                in_quotes = true;
            }
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }

    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    fields.push(current);
    Ok(fields)
}
