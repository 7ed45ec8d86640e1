use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use stagecoach_core::CycleError;

/// Confidence attached to a proposed parallel batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafetyLevel::Low => "low",
            SafetyLevel::Medium => "medium",
            SafetyLevel::High => "high",
        };
        f.write_str(s)
    }
}

/// Advisory estimate of what a batch needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceEstimate {
    pub threads: usize,
    pub memory_intensive_units: usize,
}

/// A batch of units that may run concurrently.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParallelizationOpportunity {
    pub units: Vec<String>,
    pub group: String,
    /// Heuristic only, never used to gate execution.
    pub estimated_speedup: f64,
    pub resources: ResourceEstimate,
    pub safety: SafetyLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionPhase {
    Parallel {
        units: Vec<String>,
        group: String,
        safety: SafetyLevel,
    },
    Sequential {
        units: Vec<String>,
        reason: String,
    },
}

impl ExecutionPhase {
    pub fn units(&self) -> &[String] {
        match self {
            ExecutionPhase::Parallel { units, .. } | ExecutionPhase::Sequential { units, .. } => units,
        }
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self, ExecutionPhase::Parallel { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionPhase::Parallel { .. } => "parallel",
            ExecutionPhase::Sequential { .. } => "sequential",
        }
    }
}

/// Staged plan for one set of units. Every input unit appears in exactly one phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    pub phases: Vec<ExecutionPhase>,
    /// Set when the trailing sequential phase could not be ordered and fell
    /// back to input order. Callers must not ignore this.
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "serialize_cycle")]
    pub ordering_fallback: Option<CycleError>,
}

fn serialize_cycle<S: serde::Serializer>(
    cycle: &Option<CycleError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match cycle {
        Some(c) => serializer.serialize_some(&c.units),
        None => serializer.serialize_none(),
    }
}

impl ExecutionPlan {
    /// All units in phase order.
    pub fn units(&self) -> Vec<String> {
        self.phases.iter().flat_map(|p| p.units().iter().cloned()).collect()
    }

    pub fn unit_count(&self) -> usize {
        self.phases.iter().map(|p| p.units().len()).sum()
    }

    pub fn parallel_phases(&self) -> usize {
        self.phases.iter().filter(|p| p.is_parallel()).count()
    }

    /// True when the phases partition `input` exactly once each.
    pub fn covers_exactly(&self, input: &[String]) -> bool {
        let planned = self.units();
        let distinct: BTreeSet<&String> = planned.iter().collect();
        let expected: BTreeSet<&String> = input.iter().collect();
        distinct.len() == planned.len() && distinct == expected
    }
}

/// Outcome of pairwise safety validation over a proposed batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyReport {
    pub safe: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    /// 0..=100, derived from issue and warning counts.
    pub score: u8,
}

impl SafetyReport {
    pub fn from_findings(issues: Vec<String>, warnings: Vec<String>) -> Self {
        let penalty = issues.len() * 25 + warnings.len() * 10;
        let score = 100usize.saturating_sub(penalty) as u8;
        Self {
            safe: issues.is_empty(),
            issues,
            warnings,
            score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn covers_exactly_detects_duplicates_and_gaps() {
        let plan = ExecutionPlan {
            phases: vec![
                ExecutionPhase::Parallel {
                    units: names(&["a", "b"]),
                    group: "g".into(),
                    safety: SafetyLevel::High,
                },
                ExecutionPhase::Sequential {
                    units: names(&["c"]),
                    reason: "remaining".into(),
                },
            ],
            ordering_fallback: None,
        };
        assert!(plan.covers_exactly(&names(&["c", "b", "a"])));
        assert!(!plan.covers_exactly(&names(&["a", "b"])));
        assert!(!plan.covers_exactly(&names(&["a", "b", "c", "d"])));
        assert_eq!(plan.unit_count(), 3);
        assert_eq!(plan.parallel_phases(), 1);
    }

    #[test]
    fn safety_score_decreases_with_findings() {
        assert_eq!(SafetyReport::from_findings(vec![], vec![]).score, 100);
        let report = SafetyReport::from_findings(vec!["x".into()], vec!["w".into()]);
        assert!(!report.safe);
        assert_eq!(report.score, 65);
        let many: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(SafetyReport::from_findings(many, vec![]).score, 0);
    }

    #[test]
    fn plan_serializes_phase_kind() {
        let phase = ExecutionPhase::Sequential {
            units: names(&["a"]),
            reason: "r".into(),
        };
        let json = serde_json::to_value(&phase).unwrap();
        assert_eq!(json["kind"], "sequential");
        assert_eq!(json["units"][0], "a");
    }
}
