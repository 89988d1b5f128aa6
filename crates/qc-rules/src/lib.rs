//! Tolerance rule store contracts and the configuration-backed implementation.

pub mod config;

use std::collections::BTreeMap;

use qc_protocol::{SeriesKey, ToleranceRule};
use thiserror::Error;

pub use config::{load_config, parse_config, AuditorConfig, ConfigError};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid lookup: {0}")]
    InvalidLookup(String),
    #[error("rule source unavailable: {0}")]
    Unavailable(String),
}

pub type RuleResult<T> = Result<T, RuleError>;

pub trait RuleStore {
    fn lookup(&self, machine_id: &str, metric_name: &str) -> RuleResult<Option<ToleranceRule>>;
}

/// Immutable machine → metric → rule mapping.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleSet {
    rules: BTreeMap<String, BTreeMap<String, ToleranceRule>>,
}

impl RuleSet {
    pub fn from_rules(rules: impl IntoIterator<Item = ToleranceRule>) -> Self {
        let mut set = Self::default();
        for rule in rules {
            set.rules
                .entry(rule.machine_id.clone())
                .or_default()
                .insert(rule.metric_name.clone(), rule);
        }
        set
    }

    pub fn get(&self, machine_id: &str, metric_name: &str) -> Option<&ToleranceRule> {
        self.rules.get(machine_id)?.get(metric_name)
    }

    pub fn len(&self) -> usize {
        self.rules.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn machines(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToleranceRule> {
        self.rules.values().flat_map(BTreeMap::values)
    }

    pub fn keys(&self) -> Vec<SeriesKey> {
        self.iter()
            .map(|rule| (rule.machine_id.clone(), rule.metric_name.clone()))
            .collect()
    }
}

#[derive(Clone, Debug, Default)]
pub struct StaticRuleStore {
    rules: RuleSet,
}

impl StaticRuleStore {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }
}

impl RuleStore for StaticRuleStore {
    fn lookup(&self, machine_id: &str, metric_name: &str) -> RuleResult<Option<ToleranceRule>> {
        if machine_id.trim().is_empty() || metric_name.trim().is_empty() {
            return Err(RuleError::InvalidLookup(
                "machine_id and metric_name are required".to_string(),
            ));
        }

        Ok(self.rules.get(machine_id, metric_name).cloned())
    }
}

impl<T: RuleStore + ?Sized> RuleStore for &T {
    fn lookup(&self, machine_id: &str, metric_name: &str) -> RuleResult<Option<ToleranceRule>> {
        (**self).lookup(machine_id, metric_name)
    }
}

#[cfg(test)]
mod tests {
    use qc_protocol::ToleranceRule;

    use super::{RuleError, RuleSet, RuleStore, StaticRuleStore};

    fn make_rule(machine: &str, metric: &str, target: f64) -> ToleranceRule {
        ToleranceRule {
            machine_id: machine.to_string(),
            metric_name: metric.to_string(),
            target,
            tolerance_abs: 1.0,
            unit: "%".to_string(),
        }
    }

    #[test]
    fn absent_when_not_configured() {
        let store = StaticRuleStore::new(RuleSet::from_rules([make_rule(
            "Linac_1",
            "Symmetry",
            0.5,
        )]));

        let rule = store.lookup("Linac_1", "Dose_Output").expect("lookup");
        assert!(rule.is_none());
        let rule = store.lookup("Linac_2", "Symmetry").expect("lookup");
        assert!(rule.is_none());
    }

    #[test]
    fn resolves_exact_machine_and_metric() {
        let store = StaticRuleStore::new(RuleSet::from_rules([
            make_rule("Linac_1", "Symmetry", 0.5),
            make_rule("MRI_Scanner_3T", "SNR_Coil_1", 50.0),
        ]));

        let rule = store
            .lookup("MRI_Scanner_3T", "SNR_Coil_1")
            .expect("lookup")
            .expect("configured");
        assert_eq!(rule.target, 50.0);
        assert_eq!(store.rules().len(), 2);
    }

    #[test]
    fn rejects_blank_identifiers() {
        let store = StaticRuleStore::default();
        assert!(matches!(
            store.lookup(" ", "Symmetry"),
            Err(RuleError::InvalidLookup(_))
        ));
    }
}
