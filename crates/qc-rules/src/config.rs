use std::fs;
use std::path::Path;

use qc_drift::{DriftPolicy, InvalidDriftPolicy};
use qc_protocol::ToleranceRule;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::info;

use crate::RuleSet;

const SUPPORTED_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration read failed: {0}")]
    Io(String),
    #[error("configuration parse failed: {0}")]
    Parse(String),
    #[error("unsupported schema_version: {0}")]
    UnsupportedSchemaVersion(u64),
    #[error("rule {machine}/{metric}: missing required field `{field}`")]
    MissingField {
        machine: String,
        metric: String,
        field: &'static str,
    },
    #[error("rule {machine}/{metric}: `{field}` must be {expected}")]
    InvalidField {
        machine: String,
        metric: String,
        field: &'static str,
        expected: &'static str,
    },
    #[error("rule {machine}/{metric}: tolerance_abs must not be negative, got {value}")]
    NegativeTolerance {
        machine: String,
        metric: String,
        value: f64,
    },
    #[error(transparent)]
    InvalidDriftPolicy(#[from] InvalidDriftPolicy),
    #[error("configuration defines no tolerance rules")]
    Empty,
}

/// Everything an audit run reads from its configuration file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuditorConfig {
    pub rules: RuleSet,
    pub drift: DriftPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStructuredConfig {
    #[serde(default)]
    schema_version: Option<u64>,
    #[serde(default)]
    drift: Option<DriftPolicy>,
    machines: Mapping,
}

pub fn load_config(path: &Path) -> Result<AuditorConfig, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
    let config = parse_config(&raw)?;
    info!(
        path = %path.display(),
        rules = config.rules.len(),
        machines = config.rules.machines().count(),
        "tolerance configuration loaded"
    );
    Ok(config)
}

/// Parses either the structured form (`schema_version`, `drift`, `machines`)
/// or the flat `machine -> metric -> rule` mapping.
pub fn parse_config(raw: &str) -> Result<AuditorConfig, ConfigError> {
    let document: Value =
        serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let Value::Mapping(top_level) = document else {
        return Err(ConfigError::Parse(
            "top level must be a mapping of machines".to_string(),
        ));
    };

    let (machines, drift) = if top_level.contains_key("machines") {
        let structured: RawStructuredConfig = serde_yaml::from_value(Value::Mapping(top_level))
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        let schema_version = structured
            .schema_version
            .unwrap_or(SUPPORTED_SCHEMA_VERSION);
        if schema_version != SUPPORTED_SCHEMA_VERSION {
            return Err(ConfigError::UnsupportedSchemaVersion(schema_version));
        }
        (structured.machines, structured.drift.unwrap_or_default())
    } else {
        (top_level, DriftPolicy::default())
    };

    drift.validate()?;

    let mut rules = Vec::new();
    for (machine_key, metrics) in &machines {
        let machine = key_text(machine_key)?;
        let Value::Mapping(metrics) = metrics else {
            return Err(ConfigError::Parse(format!(
                "machine `{machine}` must map metric names to rules"
            )));
        };
        for (metric_key, rule) in metrics {
            let metric = key_text(metric_key)?;
            rules.push(normalize_rule(&machine, &metric, rule)?);
        }
    }

    if rules.is_empty() {
        return Err(ConfigError::Empty);
    }

    Ok(AuditorConfig {
        rules: RuleSet::from_rules(rules),
        drift,
    })
}

fn normalize_rule(machine: &str, metric: &str, raw: &Value) -> Result<ToleranceRule, ConfigError> {
    let Value::Mapping(fields) = raw else {
        return Err(ConfigError::Parse(format!(
            "rule {machine}/{metric} must be a mapping with target, tolerance_abs and unit"
        )));
    };

    let target = number_field(machine, metric, fields, "target")?;
    let tolerance_abs = number_field(machine, metric, fields, "tolerance_abs")?;
    if tolerance_abs < 0.0 {
        return Err(ConfigError::NegativeTolerance {
            machine: machine.to_string(),
            metric: metric.to_string(),
            value: tolerance_abs,
        });
    }

    let unit = match fields.get("unit") {
        None | Some(Value::Null) => {
            return Err(ConfigError::MissingField {
                machine: machine.to_string(),
                metric: metric.to_string(),
                field: "unit",
            })
        }
        Some(Value::String(unit)) => unit.clone(),
        Some(_) => {
            return Err(ConfigError::InvalidField {
                machine: machine.to_string(),
                metric: metric.to_string(),
                field: "unit",
                expected: "text",
            })
        }
    };

    Ok(ToleranceRule {
        machine_id: machine.to_string(),
        metric_name: metric.to_string(),
        target,
        tolerance_abs,
        unit,
    })
}

fn number_field(
    machine: &str,
    metric: &str,
    fields: &Mapping,
    field: &'static str,
) -> Result<f64, ConfigError> {
    let value = match fields.get(field) {
        None | Some(Value::Null) => {
            return Err(ConfigError::MissingField {
                machine: machine.to_string(),
                metric: metric.to_string(),
                field,
            })
        }
        Some(value) => value,
    };

    let Some(number) = value.as_f64() else {
        return Err(ConfigError::InvalidField {
            machine: machine.to_string(),
            metric: metric.to_string(),
            field,
            expected: "a number",
        });
    };
    if !number.is_finite() {
        return Err(ConfigError::InvalidField {
            machine: machine.to_string(),
            metric: metric.to_string(),
            field,
            expected: "a finite number",
        });
    }
    Ok(number)
}

fn key_text(key: &Value) -> Result<String, ConfigError> {
    match key {
        Value::String(text) if !text.trim().is_empty() => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(ConfigError::Parse(format!(
            "machine and metric names must be non-empty text, found {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use qc_drift::DriftCriterion;

    use super::*;

    const FLAT: &str = r#"
Linac_1:
  Dose_Output: { target: 100.0, tolerance_abs: 2.0, unit: cGy }
  Symmetry: { target: 0.5, tolerance_abs: 1, unit: "%" }
CT_Scanner_A:
  Water_HU: { target: 0.0, tolerance_abs: 4.0, unit: HU }
"#;

    #[test]
    fn parses_flat_mapping_with_default_drift_policy() {
        let config = parse_config(FLAT).expect("config");

        assert_eq!(config.rules.len(), 3);
        assert_eq!(config.drift, DriftPolicy::default());
        let symmetry = config.rules.get("Linac_1", "Symmetry").expect("rule");
        assert_eq!(symmetry.tolerance_abs, 1.0);
        assert_eq!(symmetry.unit, "%");
    }

    #[test]
    fn parses_structured_form_with_drift_policy() {
        let raw = r#"
schema_version: 1
drift:
  min_points: 7
  alpha: 0.01
  criterion:
    kind: slope_fraction
    fraction: 0.05
machines:
  Gamma_Cam_SPECT:
    Uniformity: { target: 2.5, tolerance_abs: 1.0, unit: "%" }
"#;
        let config = parse_config(raw).expect("config");

        assert_eq!(config.drift.min_points, 7);
        assert_eq!(config.drift.alpha, 0.01);
        assert_eq!(
            config.drift.criterion,
            DriftCriterion::SlopeFraction { fraction: 0.05 }
        );
        assert!(config.rules.get("Gamma_Cam_SPECT", "Uniformity").is_some());
    }

    #[test]
    fn zero_tolerance_is_allowed() {
        let config = parse_config("M:\n  m: { target: 1.0, tolerance_abs: 0.0, unit: mm }\n")
            .expect("config");
        assert_eq!(config.rules.get("M", "m").expect("rule").tolerance_abs, 0.0);
    }

    #[test]
    fn rejects_invalid_drift_policy() {
        let raw = "machines:\n  M:\n    m: { target: 1.0, tolerance_abs: 0.1, unit: mm }\ndrift:\n  alpha: 2.0\n";
        assert!(matches!(
            parse_config(raw),
            Err(ConfigError::InvalidDriftPolicy(_))
        ));
    }

    #[test]
    fn rejects_unsupported_schema_version() {
        let raw = "schema_version: 3\nmachines:\n  M:\n    m: { target: 1.0, tolerance_abs: 0.1, unit: mm }\n";
        assert!(matches!(
            parse_config(raw),
            Err(ConfigError::UnsupportedSchemaVersion(3))
        ));
    }

    #[test]
    fn rejects_non_mapping_documents() {
        assert!(matches!(
            parse_config("- just\n- a list\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            parse_config("Linac_1: 4\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(parse_config("{}\n"), Err(ConfigError::Empty)));
    }
}
