//! Dependency analysis and staged planning.

use std::collections::{BTreeMap, BTreeSet};

use stagecoach_core::config::AnalyzerConfig;
use stagecoach_core::{Classification, CycleError, Result, UnitClassifier};
use tracing::{debug, info, warn};

use crate::graph::DependencyGraph;
use crate::metadata::MetadataSource;
use crate::plan::{
    ExecutionPhase, ExecutionPlan, ParallelizationOpportunity, ResourceEstimate, SafetyLevel,
    SafetyReport,
};
use crate::policy::ConditionalPolicy;

const INDEPENDENT_GROUP: &str = "independent";
const CONDITIONAL_GROUP: &str = "conditional";

/// Owns the dependency graph and the enriched classifier for one run.
#[derive(Debug, Clone)]
pub struct DependencyAnalyzer {
    /// Classifier as configured, before graph enrichment.
    configured: UnitClassifier,
    classifier: UnitClassifier,
    graph: DependencyGraph,
    policy: ConditionalPolicy,
    memory_intensive_limit: usize,
}

impl DependencyAnalyzer {
    /// Analyzer over the configured dependencies only. Call [`load`](Self::load)
    /// to add declared project dependencies.
    pub fn new(classifier: UnitClassifier, config: &AnalyzerConfig) -> Self {
        let graph = build_graph(&classifier);
        Self {
            configured: classifier.clone(),
            classifier,
            graph,
            policy: ConditionalPolicy::new(config.conditional.clone()),
            memory_intensive_limit: config.memory_intensive_limit,
        }
    }

    /// (Re)load dependency metadata, rebuilding the graph and the enriched
    /// classifier from the configured table plus the loaded snapshot.
    pub fn load(&mut self, source: &dyn MetadataSource) -> Result<()> {
        let metadata = source.load()?;
        self.classifier = self.configured.with_enriched_dependencies(&metadata.upstream);
        self.graph = build_graph(&self.classifier);
        let stats = self.graph.stats();
        info!(
            units = stats.node_count,
            edges = stats.edge_count,
            "Dependency graph built"
        );
        Ok(())
    }

    pub fn classifier(&self) -> &UnitClassifier {
        &self.classifier
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn policy(&self) -> &ConditionalPolicy {
        &self.policy
    }

    pub fn topological_order(&self, units: &[String]) -> std::result::Result<Vec<String>, CycleError> {
        self.graph.topological_sort(units)
    }

    /// Propose parallel batches: one high-safety batch per parallel group,
    /// one pooled batch of ungrouped parallel-safe units, and, only when
    /// `allow_conditional` is set, one medium-safety batch of conditional
    /// units that pass the policy heuristic.
    ///
    /// A unit only joins a batch when every dependency it has inside `units`
    /// sits in an earlier batch, so running batches in order never runs a
    /// unit before its upstream.
    pub fn identify_parallelization_opportunities(
        &self,
        units: &[String],
        max_parallelism: usize,
        allow_conditional: bool,
    ) -> Vec<ParallelizationOpportunity> {
        let units = dedup(units);
        let input: BTreeSet<&str> = units.iter().map(String::as_str).collect();
        let mut placed: BTreeSet<String> = BTreeSet::new();
        let mut opportunities = Vec::new();

        let mut candidates: Vec<(String, Vec<String>, SafetyLevel)> = self
            .classifier
            .get_parallel_groups(&units)
            .into_iter()
            .map(|(group, members)| (group, members, SafetyLevel::High))
            .collect();

        let ungrouped: Vec<String> = self
            .classifier
            .get_parallel_safe(&units)
            .into_iter()
            .filter(|u| self.classifier.unit(u).parallel_group.is_none())
            .collect();
        candidates.push((INDEPENDENT_GROUP.to_string(), ungrouped, SafetyLevel::High));

        if allow_conditional {
            let conditional: Vec<String> = self
                .classifier
                .get_conditional(&units)
                .into_iter()
                .filter(|u| match self.policy.evaluate(&self.classifier.unit(u)) {
                    Ok(()) => true,
                    Err(reason) => {
                        debug!(unit = %u, %reason, "Conditional unit kept sequential");
                        false
                    }
                })
                .collect();
            candidates.push((CONDITIONAL_GROUP.to_string(), conditional, SafetyLevel::Medium));
        }

        for (group, members, safety) in candidates {
            let batch: Vec<String> = self
                .independent_members(&members)
                .into_iter()
                .filter(|u| self.thread_safe(u))
                .filter(|u| self.upstream_placed(u, &input, &placed))
                .take(max_parallelism.max(1))
                .collect();
            if batch.len() < 2 {
                continue;
            }
            placed.extend(batch.iter().cloned());
            opportunities.push(self.opportunity(group, batch, safety));
        }

        opportunities
    }

    /// Members with no ordering relation (direct or transitive, either
    /// direction) to any other member.
    fn independent_members(&self, members: &[String]) -> Vec<String> {
        members
            .iter()
            .filter(|u| {
                members
                    .iter()
                    .filter(|other| other != u)
                    .all(|other| !self.related(u, other))
            })
            .cloned()
            .collect()
    }

    fn thread_safe(&self, unit: &str) -> bool {
        let safe = self.classifier.unit(unit).thread_safe;
        if !safe {
            debug!(unit, "Unit is not thread-safe, kept sequential");
        }
        safe
    }

    fn related(&self, a: &str, b: &str) -> bool {
        self.graph.has_edge_between(a, b) || self.graph.is_ordered(a, b)
    }

    fn upstream_placed(&self, unit: &str, input: &BTreeSet<&str>, placed: &BTreeSet<String>) -> bool {
        self.graph
            .transitive_dependencies(unit)
            .iter()
            .filter(|d| input.contains(d.as_str()))
            .all(|d| placed.contains(d))
    }

    fn opportunity(&self, group: String, units: Vec<String>, safety: SafetyLevel) -> ParallelizationOpportunity {
        let n = units.len();
        let memory_intensive_units = units
            .iter()
            .filter(|u| self.classifier.unit(u).memory_intensive)
            .count();
        ParallelizationOpportunity {
            estimated_speedup: n as f64 / (1.0 + 0.1 * (n - 1) as f64),
            resources: ResourceEstimate {
                threads: n,
                memory_intensive_units,
            },
            units,
            group,
            safety,
        }
    }

    /// Parallel phases for accepted opportunities (in opportunity order),
    /// then one sequential phase with everything else in dependency order.
    pub fn create_execution_plan(
        &self,
        units: &[String],
        max_parallelism: usize,
        allow_conditional: bool,
    ) -> ExecutionPlan {
        let units = dedup(units);
        for name in units.iter().filter(|u| !self.classifier.is_known(u)) {
            let unit = self.classifier.unit(name);
            debug!(unit = %name, reason = unit.source.reason(), "Planning unit missing from classification table");
        }
        let opportunities =
            self.identify_parallelization_opportunities(&units, max_parallelism, allow_conditional);

        let mut covered: BTreeSet<String> = BTreeSet::new();
        let mut phases = Vec::new();
        for opp in opportunities {
            covered.extend(opp.units.iter().cloned());
            phases.push(ExecutionPhase::Parallel {
                units: opp.units,
                group: opp.group,
                safety: opp.safety,
            });
        }

        let remaining: Vec<String> = units.into_iter().filter(|u| !covered.contains(u)).collect();
        let mut ordering_fallback = None;
        if !remaining.is_empty() {
            let ordered = match self.graph.topological_sort(&remaining) {
                Ok(order) => order,
                Err(cycle) => {
                    warn!(units = ?cycle.units, "Cycle in sequential remainder, keeping input order");
                    ordering_fallback = Some(cycle);
                    remaining
                }
            };
            phases.push(ExecutionPhase::Sequential {
                units: ordered,
                reason: "remaining units in dependency order".to_string(),
            });
        }

        ExecutionPlan {
            phases,
            ordering_fallback,
        }
    }

    /// Strict pairwise validation: conditional units are never approved.
    pub fn validate_execution_safety(&self, units: &[String]) -> SafetyReport {
        self.validate_phase_safety(units, false)
    }

    /// Pairwise validation of a proposed batch. With `allow_conditional`,
    /// conditional units that pass the policy count as parallel-safe.
    pub fn validate_phase_safety(&self, units: &[String], allow_conditional: bool) -> SafetyReport {
        let units = dedup(units);
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        for (i, a) in units.iter().enumerate() {
            for b in &units[i + 1..] {
                if let Some(issue) = self.pair_issue(a, b, allow_conditional) {
                    issues.push(issue);
                }
            }
        }

        let memory_intensive: Vec<&String> = units
            .iter()
            .filter(|u| self.classifier.unit(u).memory_intensive)
            .collect();
        if units.len() > 1 && memory_intensive.len() > self.memory_intensive_limit {
            warnings.push(format!(
                "{} memory-intensive units proposed together: {}",
                memory_intensive.len(),
                memory_intensive.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            ));
        }

        SafetyReport::from_findings(issues, warnings)
    }

    fn pair_issue(&self, a: &str, b: &str, allow_conditional: bool) -> Option<String> {
        let ua = self.classifier.unit(a);
        let ub = self.classifier.unit(b);
        if ub.depends_on(a) || self.graph.dependencies(b).is_some_and(|d| d.contains(a)) {
            return Some(format!("{b} depends on {a}"));
        }
        if ua.depends_on(b) || self.graph.dependencies(a).is_some_and(|d| d.contains(b)) {
            return Some(format!("{a} depends on {b}"));
        }
        if self.graph.transitive_dependencies(b).contains(a) {
            return Some(format!("{b} transitively depends on {a}"));
        }
        if self.graph.transitive_dependencies(a).contains(b) {
            return Some(format!("{a} transitively depends on {b}"));
        }
        for unit in [&ua, &ub] {
            if !unit.thread_safe {
                return Some(format!("{} is not thread-safe", unit.name));
            }
        }
        if self.classifier.can_run_in_parallel(a, b) {
            return None;
        }
        let eligible = |class: Classification, unit: &stagecoach_core::Unit| match class {
            Classification::ParallelSafe => true,
            Classification::Conditional => allow_conditional && self.policy.permits(unit),
            Classification::Sequential => false,
        };
        if eligible(ua.classification, &ua) && eligible(ub.classification, &ub) {
            return None;
        }
        Some(format!(
            "{a} ({}) and {b} ({}) cannot run in parallel",
            ua.classification, ub.classification
        ))
    }
}

fn build_graph(classifier: &UnitClassifier) -> DependencyGraph {
    let mut upstream: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for name in classifier.known_units() {
        upstream.insert(name.to_string(), classifier.dependencies(name));
    }
    DependencyGraph::from_upstream(&upstream)
}

fn dedup(units: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    units.iter().filter(|u| seen.insert(u.as_str())).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::StaticMetadata;
    use stagecoach_core::UnitSpec;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// A, B independent parallel-safe; C sequential; D, E, F conditional
    /// with D depending on C.
    fn scenario() -> DependencyAnalyzer {
        let mut table = BTreeMap::new();
        table.insert("a".to_string(), UnitSpec::new(Classification::ParallelSafe));
        table.insert("b".to_string(), UnitSpec::new(Classification::ParallelSafe));
        table.insert("c".to_string(), UnitSpec::new(Classification::Sequential));
        table.insert("d".to_string(), UnitSpec::new(Classification::Conditional).with_dependency("c"));
        table.insert("e".to_string(), UnitSpec::new(Classification::Conditional));
        table.insert("f".to_string(), UnitSpec::new(Classification::Conditional));
        let classifier = UnitClassifier::new(&table).unwrap();
        DependencyAnalyzer::new(classifier, &AnalyzerConfig::default())
    }

    fn staging() -> DependencyAnalyzer {
        let mut table = BTreeMap::new();
        for name in ["stg_people", "stg_jobs", "stg_comp"] {
            table.insert(
                name.to_string(),
                UnitSpec::new(Classification::ParallelSafe).with_group("staging").memory_intensive(),
            );
        }
        table.insert("dim_levels".to_string(), UnitSpec::new(Classification::ParallelSafe));
        table.insert("dim_hazard".to_string(), UnitSpec::new(Classification::ParallelSafe));
        table.insert("int_baseline".to_string(), UnitSpec::new(Classification::Conditional));
        table.insert("stg_extra".to_string(), UnitSpec::new(Classification::Conditional));
        table.insert("fct_events".to_string(), UnitSpec::new(Classification::Sequential));
        let classifier = UnitClassifier::new(&table).unwrap();
        DependencyAnalyzer::new(classifier, &AnalyzerConfig::default())
    }

    #[test]
    fn scenario_plan_without_conditional_parallelization() {
        let analyzer = scenario();
        let input = names(&["a", "b", "c", "d", "e", "f"]);
        let plan = analyzer.create_execution_plan(&input, 4, false);

        assert!(plan.covers_exactly(&input));
        assert!(plan.ordering_fallback.is_none());
        assert_eq!(plan.phases.len(), 2);
        match &plan.phases[0] {
            ExecutionPhase::Parallel { units, safety, .. } => {
                assert_eq!(units, &names(&["a", "b"]));
                assert_eq!(*safety, SafetyLevel::High);
            }
            other => panic!("expected parallel phase, got {other:?}"),
        }
        match &plan.phases[1] {
            ExecutionPhase::Sequential { units, .. } => {
                let pos = |u: &str| units.iter().position(|x| x == u).unwrap();
                assert!(pos("c") < pos("d"));
                assert_eq!(units.len(), 4);
            }
            other => panic!("expected sequential phase, got {other:?}"),
        }
    }

    #[test]
    fn scenario_validate_names_the_dependency() {
        let analyzer = scenario();
        let mut table = BTreeMap::new();
        table.insert("a".to_string(), UnitSpec::new(Classification::ParallelSafe));
        table.insert("b".to_string(), UnitSpec::new(Classification::ParallelSafe).with_dependency("a"));
        let analyzer_ab = DependencyAnalyzer::new(UnitClassifier::new(&table).unwrap(), &AnalyzerConfig::default());

        let report = analyzer_ab.validate_execution_safety(&names(&["a", "b"]));
        assert!(!report.safe);
        assert_eq!(report.issues, vec!["b depends on a".to_string()]);
        assert!(report.score < 100);

        let report = analyzer.validate_execution_safety(&names(&["a", "b"]));
        assert!(report.safe);
        assert_eq!(report.score, 100);
    }

    #[test]
    fn groups_and_pool_become_separate_opportunities() {
        let analyzer = staging();
        let input = names(&["stg_people", "dim_levels", "stg_jobs", "fct_events", "dim_hazard", "stg_comp"]);
        let opps = analyzer.identify_parallelization_opportunities(&input, 8, false);

        assert_eq!(opps.len(), 2);
        assert_eq!(opps[0].group, "staging");
        assert_eq!(opps[0].units, names(&["stg_people", "stg_jobs", "stg_comp"]));
        assert_eq!(opps[0].resources.memory_intensive_units, 3);
        assert_eq!(opps[1].group, "independent");
        assert_eq!(opps[1].units, names(&["dim_levels", "dim_hazard"]));
        assert!(opps.iter().all(|o| o.safety == SafetyLevel::High));
        assert!(opps[0].estimated_speedup > 1.0);
    }

    #[test]
    fn opportunities_are_capped_at_max_parallelism() {
        let analyzer = staging();
        let input = names(&["stg_people", "stg_jobs", "stg_comp"]);
        let plan = analyzer.create_execution_plan(&input, 2, false);
        assert!(plan.covers_exactly(&input));
        assert_eq!(plan.phases[0].units(), &names(&["stg_people", "stg_jobs"])[..]);
        assert_eq!(plan.phases[1].units(), &names(&["stg_comp"])[..]);
    }

    #[test]
    fn conditional_units_need_opt_in_and_policy_approval() {
        let analyzer = staging();
        let input = names(&["int_baseline", "stg_extra", "fct_events"]);

        let opps = analyzer.identify_parallelization_opportunities(&input, 8, false);
        assert!(opps.is_empty());

        let opps = analyzer.identify_parallelization_opportunities(&input, 8, true);
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].safety, SafetyLevel::Medium);
        assert_eq!(opps[0].units, names(&["int_baseline", "stg_extra"]));

        // Strict validation still rejects the pair; opt-in validation accepts it.
        assert!(!analyzer.validate_execution_safety(&opps[0].units).safe);
        assert!(analyzer.validate_phase_safety(&opps[0].units, true).safe);
    }

    #[test]
    fn units_that_are_not_thread_safe_stay_out_of_batches() {
        let mut table = BTreeMap::new();
        table.insert("dim_levels".to_string(), UnitSpec::new(Classification::ParallelSafe));
        table.insert("dim_hazard".to_string(), UnitSpec::new(Classification::ParallelSafe));
        table.insert(
            "dim_calendar".to_string(),
            UnitSpec {
                thread_safe: false,
                ..UnitSpec::new(Classification::ParallelSafe)
            },
        );
        let analyzer = DependencyAnalyzer::new(UnitClassifier::new(&table).unwrap(), &AnalyzerConfig::default());
        let input = names(&["dim_levels", "dim_calendar", "dim_hazard"]);

        let plan = analyzer.create_execution_plan(&input, 8, false);
        assert!(plan.covers_exactly(&input));
        assert_eq!(plan.phases[0].units(), &names(&["dim_levels", "dim_hazard"])[..]);
        assert_eq!(plan.phases[1].units(), &names(&["dim_calendar"])[..]);

        let report = analyzer.validate_execution_safety(&names(&["dim_levels", "dim_calendar"]));
        assert!(!report.safe);
        assert_eq!(report.issues, vec!["dim_calendar is not thread-safe".to_string()]);
    }

    #[test]
    fn unknown_units_are_never_parallelized() {
        let analyzer = staging();
        let input = names(&["mystery_one", "mystery_two"]);
        let plan = analyzer.create_execution_plan(&input, 8, true);
        assert_eq!(plan.parallel_phases(), 0);
        assert!(plan.covers_exactly(&input));
    }

    #[test]
    fn loaded_dependencies_split_a_group() {
        let mut analyzer = staging();
        analyzer
            .load(&StaticMetadata::new().with_dependency("stg_jobs", "stg_people"))
            .unwrap();
        let input = names(&["stg_people", "stg_jobs", "stg_comp"]);
        let plan = analyzer.create_execution_plan(&input, 8, false);

        assert!(plan.covers_exactly(&input));
        // Both ends of the edge leave the batch, leaving a single unit, which
        // is not worth a parallel phase.
        assert_eq!(plan.parallel_phases(), 0);
        let seq = plan.phases[0].units();
        let pos = |u: &str| seq.iter().position(|x| x == u).unwrap();
        assert!(pos("stg_people") < pos("stg_jobs"));
    }

    #[test]
    fn parallel_unit_waits_for_upstream_in_input() {
        let mut analyzer = staging();
        analyzer
            .load(&StaticMetadata::new().with_dependency("dim_levels", "fct_events"))
            .unwrap();
        let input = names(&["fct_events", "dim_levels", "dim_hazard", "stg_people", "stg_jobs"]);
        let plan = analyzer.create_execution_plan(&input, 8, false);

        for phase in &plan.phases {
            if phase.is_parallel() {
                assert!(!phase.units().contains(&"dim_levels".to_string()));
            }
        }
        assert!(plan.covers_exactly(&input));
    }

    #[test]
    fn cycle_in_remainder_is_surfaced() {
        let mut analyzer = scenario();
        analyzer
            .load(&StaticMetadata::new().with_dependency("c", "d"))
            .unwrap();
        let input = names(&["c", "d", "e"]);
        let plan = analyzer.create_execution_plan(&input, 4, false);

        let cycle = plan.ordering_fallback.as_ref().expect("cycle must be reported");
        assert_eq!(cycle.units, names(&["c", "d"]));
        assert_eq!(plan.phases[0].units(), &input[..]);
        assert!(analyzer.topological_order(&input).is_err());
    }

    #[test]
    fn memory_intensive_batch_warns_without_failing() {
        let analyzer = staging();
        let report = analyzer.validate_execution_safety(&names(&["stg_people", "stg_jobs", "stg_comp"]));
        assert!(report.safe);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.score, 90);
    }

    #[test]
    fn sequential_pairs_are_issues() {
        let analyzer = staging();
        let report = analyzer.validate_execution_safety(&names(&["fct_events", "dim_levels"]));
        assert!(!report.safe);
        assert!(report.issues[0].contains("cannot run in parallel"));
    }

    #[test]
    fn duplicate_input_units_are_planned_once() {
        let analyzer = staging();
        let input = names(&["dim_levels", "dim_hazard", "dim_levels"]);
        let plan = analyzer.create_execution_plan(&input, 8, false);
        assert_eq!(plan.unit_count(), 2);
    }
}
