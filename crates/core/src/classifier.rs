//! Static unit classification.
//!
//! The classifier is an immutable lookup built from the `[units]` table of
//! the configuration. It never infers a class from unit content: a name that
//! is not in the table is classified `Conditional`, which keeps it out of any
//! automatically proposed parallel batch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{Result, StagecoachError};
use crate::unit::{Classification, Unit, UnitSpec};

#[derive(Debug, Clone, Default)]
pub struct UnitClassifier {
    units: Arc<BTreeMap<String, Unit>>,
}

impl UnitClassifier {
    /// Build a classifier from the static table, rejecting malformed rows.
    pub fn new(table: &BTreeMap<String, UnitSpec>) -> Result<Self> {
        validate_table(table)?;
        let units = table
            .iter()
            .map(|(name, spec)| (name.clone(), Unit::from_spec(name, spec)))
            .collect();
        Ok(Self {
            units: Arc::new(units),
        })
    }

    /// Return a new classifier whose units also carry graph-derived
    /// dependencies. Classes are unchanged; names only known from the graph
    /// stay conservative.
    pub fn with_enriched_dependencies(
        &self,
        upstream: &BTreeMap<String, BTreeSet<String>>,
    ) -> Self {
        let mut units = (*self.units).clone();
        for (name, deps) in upstream {
            let unit = units
                .entry(name.clone())
                .or_insert_with(|| Unit::unknown(name));
            unit.dependencies.extend(deps.iter().filter(|d| *d != name).cloned());
        }
        Self {
            units: Arc::new(units),
        }
    }

    /// Total and deterministic: unknown names are `Conditional`.
    pub fn classify(&self, name: &str) -> Classification {
        self.units
            .get(name)
            .map(|u| u.classification)
            .unwrap_or(Classification::Conditional)
    }

    /// Full metadata for a unit, falling back to the conservative default.
    pub fn unit(&self, name: &str) -> Unit {
        self.units
            .get(name)
            .cloned()
            .unwrap_or_else(|| Unit::unknown(name))
    }

    /// Whether `name` has a row in the table (or was added by enrichment).
    pub fn is_known(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    /// Every classified unit, sorted by name.
    pub fn known_units(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    /// Configured plus enriched dependencies; empty for unknown names.
    pub fn dependencies(&self, name: &str) -> BTreeSet<String> {
        self.units
            .get(name)
            .map(|u| u.dependencies.clone())
            .unwrap_or_default()
    }

    /// Units of `names` classified `ParallelSafe`, in input order.
    pub fn get_parallel_safe(&self, names: &[String]) -> Vec<String> {
        self.filter_by(names, Classification::ParallelSafe)
    }

    /// Units of `names` classified `Sequential`, in input order.
    pub fn get_sequential(&self, names: &[String]) -> Vec<String> {
        self.filter_by(names, Classification::Sequential)
    }

    /// Units of `names` classified `Conditional`, unknown names included.
    pub fn get_conditional(&self, names: &[String]) -> Vec<String> {
        self.filter_by(names, Classification::Conditional)
    }

    fn filter_by(&self, names: &[String], class: Classification) -> Vec<String> {
        names
            .iter()
            .filter(|n| self.classify(n) == class)
            .cloned()
            .collect()
    }

    /// Group parallel-safe units by their `parallel_group`, preserving input order
    /// within each group. Ungrouped units are left out.
    pub fn get_parallel_groups(&self, names: &[String]) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in names {
            let Some(unit) = self.units.get(name) else {
                continue;
            };
            if unit.classification != Classification::ParallelSafe {
                continue;
            }
            if let Some(group) = &unit.parallel_group {
                groups.entry(group.clone()).or_default().push(name.clone());
            }
        }
        groups
    }

    /// Whether two units may share a parallel batch. Conditional pairs are
    /// never approved here; the analyzer's policy decides those. A unit
    /// marked `thread_safe = false` never shares a batch.
    pub fn can_run_in_parallel(&self, a: &str, b: &str) -> bool {
        if a == b {
            return false;
        }
        let ua = self.unit(a);
        let ub = self.unit(b);
        if ua.classification == Classification::Sequential
            || ub.classification == Classification::Sequential
        {
            return false;
        }
        if !ua.thread_safe || !ub.thread_safe {
            return false;
        }
        if ua.depends_on(b) || ub.depends_on(a) {
            return false;
        }
        ua.classification == Classification::ParallelSafe
            && ub.classification == Classification::ParallelSafe
    }
}

/// Reject table rows that would make classification ambiguous.
pub fn validate_table(table: &BTreeMap<String, UnitSpec>) -> Result<()> {
    for (name, spec) in table {
        if name.trim().is_empty() {
            return Err(StagecoachError::Configuration(
                "unit name must not be empty".into(),
            ));
        }
        if spec.dependencies.contains(name) {
            return Err(StagecoachError::Configuration(format!(
                "unit {name} lists itself as a dependency"
            )));
        }
        if spec.parallel_group.is_some() && spec.classification != Classification::ParallelSafe {
            return Err(StagecoachError::Configuration(format!(
                "unit {name} has a parallel_group but is classified {}",
                spec.classification
            )));
        }
    }
    Ok(())
}
