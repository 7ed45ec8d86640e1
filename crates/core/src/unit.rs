use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Safety class of a unit with respect to concurrent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Must never share a phase with another unit.
    Sequential,
    /// Safe to run alongside other parallel-safe units it has no edge to.
    ParallelSafe,
    /// Parallel only when the caller opts in and the policy heuristic agrees.
    Conditional,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Classification::Sequential => "sequential",
            Classification::ParallelSafe => "parallel_safe",
            Classification::Conditional => "conditional",
        };
        f.write_str(s)
    }
}

/// Where a unit's classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Configured,
    /// Unit absent from the table; treated as conditional.
    UnknownConservative,
}

impl ClassificationSource {
    pub fn reason(&self) -> &'static str {
        match self {
            ClassificationSource::Configured => "configured classification",
            ClassificationSource::UnknownConservative => {
                "unknown unit, conservative default (conditional)"
            }
        }
    }
}

/// One row of the static classification table, as written in `[units.<name>]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSpec {
    pub classification: Classification,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub memory_intensive: bool,
    #[serde(default = "default_thread_safe")]
    pub thread_safe: bool,
}

fn default_thread_safe() -> bool {
    true
}

impl UnitSpec {
    pub fn new(classification: Classification) -> Self {
        Self {
            classification,
            dependencies: BTreeSet::new(),
            tags: BTreeSet::new(),
            parallel_group: None,
            memory_intensive: false,
            thread_safe: default_thread_safe(),
        }
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.parallel_group = Some(group.to_string());
        self
    }

    pub fn with_dependency(mut self, dep: &str) -> Self {
        self.dependencies.insert(dep.to_string());
        self
    }

    pub fn memory_intensive(mut self) -> Self {
        self.memory_intensive = true;
        self
    }
}

/// A named transformation unit, as seen by the planner for one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Unit {
    pub name: String,
    pub classification: Classification,
    pub dependencies: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub parallel_group: Option<String>,
    pub memory_intensive: bool,
    pub thread_safe: bool,
    pub source: ClassificationSource,
}

impl Unit {
    pub fn from_spec(name: &str, spec: &UnitSpec) -> Self {
        Self {
            name: name.to_string(),
            classification: spec.classification,
            dependencies: spec.dependencies.clone(),
            tags: spec.tags.clone(),
            parallel_group: spec.parallel_group.clone(),
            memory_intensive: spec.memory_intensive,
            thread_safe: spec.thread_safe,
            source: ClassificationSource::Configured,
        }
    }

    /// The conservative stand-in for a name missing from the table.
    pub fn unknown(name: &str) -> Self {
        Self {
            name: name.to_string(),
            classification: Classification::Conditional,
            dependencies: BTreeSet::new(),
            tags: BTreeSet::new(),
            parallel_group: None,
            memory_intensive: false,
            thread_safe: false,
            source: ClassificationSource::UnknownConservative,
        }
    }

    pub fn depends_on(&self, other: &str) -> bool {
        self.dependencies.contains(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_spec_deserializes_with_defaults() {
        let spec: UnitSpec = toml::from_str(r#"classification = "parallel_safe""#).unwrap();
        assert_eq!(spec.classification, Classification::ParallelSafe);
        assert!(spec.dependencies.is_empty());
        assert!(spec.parallel_group.is_none());
        assert!(!spec.memory_intensive);
        assert!(spec.thread_safe);
    }

    #[test]
    fn unknown_unit_is_conditional_and_not_thread_safe() {
        let unit = Unit::unknown("mystery");
        assert_eq!(unit.classification, Classification::Conditional);
        assert_eq!(unit.source, ClassificationSource::UnknownConservative);
        assert!(!unit.thread_safe);
        assert!(unit.source.reason().contains("conservative"));
    }

    #[test]
    fn classification_display_matches_serde_names() {
        assert_eq!(Classification::ParallelSafe.to_string(), "parallel_safe");
        let json = serde_json::to_string(&Classification::ParallelSafe).unwrap();
        assert_eq!(json, "\"parallel_safe\"");
    }
}
