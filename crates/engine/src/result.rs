use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use stagecoach_core::{ExecutionContext, UnitOutcome, Variables};
use stagecoach_resources::ResourcePressure;

/// One stage invocation.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub stage: String,
    pub units: Vec<String>,
    pub simulation_year: i32,
    pub variables: Variables,
    pub allow_conditional: bool,
    /// Base execution id; a random one is generated when absent.
    pub execution_id: Option<String>,
}

impl StageRequest {
    pub fn new(stage: &str, units: &[&str]) -> Self {
        Self {
            stage: stage.to_string(),
            units: units.iter().map(|u| u.to_string()).collect(),
            simulation_year: 0,
            variables: Variables::new(),
            allow_conditional: false,
            execution_id: None,
        }
    }

    pub fn with_units(mut self, units: Vec<String>) -> Self {
        self.units = units;
        self
    }

    pub fn with_year(mut self, year: i32) -> Self {
        self.simulation_year = year;
        self
    }

    pub fn with_variable(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.variables.insert(key.to_string(), value.into());
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn allow_conditional(mut self, allow: bool) -> Self {
        self.allow_conditional = allow;
        self
    }

    pub fn with_execution_id(mut self, id: &str) -> Self {
        self.execution_id = Some(id.to_string());
        self
    }

    pub(crate) fn context(&self) -> ExecutionContext {
        let ctx = ExecutionContext::new(&self.stage, self.simulation_year, self.variables.clone());
        match &self.execution_id {
            Some(id) => ctx.with_execution_id(id),
            None => ctx,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitResult {
    pub unit: String,
    pub execution_id: String,
    pub phase: usize,
    pub ordinal: usize,
    pub seed: Option<u64>,
    pub success: bool,
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    /// Set when the executor call itself failed or panicked.
    pub error: Option<String>,
}

impl UnitResult {
    pub(crate) fn from_outcome(ctx: &ExecutionContext, unit: &str, phase: usize, ordinal: usize, outcome: UnitOutcome) -> Self {
        Self {
            unit: unit.to_string(),
            execution_id: ctx.execution_id.clone(),
            phase,
            ordinal,
            seed: ctx.seed,
            success: outcome.success,
            return_code: outcome.return_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            elapsed: outcome.elapsed,
            error: None,
        }
    }

    pub(crate) fn from_error(
        ctx: &ExecutionContext,
        unit: &str,
        phase: usize,
        ordinal: usize,
        message: String,
        elapsed: Duration,
    ) -> Self {
        Self {
            unit: unit.to_string(),
            execution_id: ctx.execution_id.clone(),
            phase,
            ordinal,
            seed: ctx.seed,
            success: false,
            return_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            elapsed,
            error: Some(message),
        }
    }

    /// Human-readable failure description, if the unit failed.
    pub fn failure(&self) -> Option<String> {
        if self.success {
            return None;
        }
        Some(match &self.error {
            Some(e) => format!("{}: {}", self.unit, e),
            None if self.stderr.trim().is_empty() => {
                format!("{}: exited with code {}", self.unit, self.return_code)
            }
            None => format!(
                "{}: exited with code {}: {}",
                self.unit,
                self.return_code,
                self.stderr.trim()
            ),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseSummary {
    pub index: usize,
    pub kind: String,
    pub units: Vec<String>,
    pub workers: usize,
    pub success: bool,
    pub elapsed: Duration,
    /// Why a planned parallel phase ran sequentially instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demoted: Option<String>,
}

/// Outcome of a phase, or of a whole stage once phases are merged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub stage: String,
    pub execution_id: String,
    pub success: bool,
    pub unit_results: BTreeMap<String, UnitResult>,
    /// Order in which unit results were merged.
    pub completion_order: Vec<String>,
    pub execution_time: Duration,
    /// Largest worker pool used by any phase.
    pub parallelism_achieved: usize,
    pub phases: Vec<PhaseSummary>,
    pub resource_snapshot: Option<ResourcePressure>,
    pub errors: Vec<String>,
}

impl ExecutionResult {
    pub fn empty(stage: &str, execution_id: &str) -> Self {
        Self {
            stage: stage.to_string(),
            execution_id: execution_id.to_string(),
            success: true,
            unit_results: BTreeMap::new(),
            completion_order: Vec::new(),
            execution_time: Duration::ZERO,
            parallelism_achieved: 0,
            phases: Vec::new(),
            resource_snapshot: None,
            errors: Vec::new(),
        }
    }

    pub(crate) fn push_unit(&mut self, result: UnitResult) {
        if let Some(failure) = result.failure() {
            self.errors.push(failure);
            self.success = false;
        }
        self.completion_order.push(result.unit.clone());
        self.unit_results.insert(result.unit.clone(), result);
    }

    /// Fold a phase result into this stage result.
    pub fn merge(&mut self, other: ExecutionResult) {
        self.success &= other.success;
        self.completion_order.extend(other.completion_order);
        self.unit_results.extend(other.unit_results);
        self.execution_time += other.execution_time;
        self.parallelism_achieved = self.parallelism_achieved.max(other.parallelism_achieved);
        self.phases.extend(other.phases);
        self.errors.extend(other.errors);
        if other.resource_snapshot.is_some() {
            self.resource_snapshot = other.resource_snapshot;
        }
    }

    pub fn failed_units(&self) -> Vec<&str> {
        self.unit_results
            .values()
            .filter(|r| !r.success)
            .map(|r| r.unit.as_str())
            .collect()
    }

    /// Seed per unit, in unit-name order.
    pub fn seeds(&self) -> BTreeMap<String, Option<u64>> {
        self.unit_results
            .iter()
            .map(|(unit, r)| (unit.clone(), r.seed))
            .collect()
    }

    /// SHA-256 over unit name, success, seed and return code of every unit,
    /// in unit-name order. Independent of merge order and timing.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (unit, r) in &self.unit_results {
            hasher.update(unit.as_bytes());
            hasher.update([0u8, r.success as u8]);
            match r.seed {
                Some(seed) => hasher.update(seed.to_be_bytes()),
                None => hasher.update([0xFFu8; 8]),
            }
            hasher.update(r.return_code.to_be_bytes());
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(name: &str, success: bool, seed: u64) -> UnitResult {
        UnitResult {
            unit: name.to_string(),
            execution_id: format!("x:0:0:{name}"),
            phase: 0,
            ordinal: 0,
            seed: Some(seed),
            success,
            return_code: if success { 0 } else { 2 },
            stdout: String::new(),
            stderr: if success { String::new() } else { "boom".into() },
            elapsed: Duration::from_millis(5),
            error: None,
        }
    }

    #[test]
    fn content_hash_ignores_merge_order_and_timing() {
        let mut a = ExecutionResult::empty("s", "x");
        a.push_unit(unit("one", true, 1));
        a.push_unit(unit("two", true, 2));

        let mut b = ExecutionResult::empty("s", "y");
        let mut two = unit("two", true, 2);
        two.elapsed = Duration::from_secs(3);
        b.push_unit(two);
        b.push_unit(unit("one", true, 1));

        assert_ne!(a.completion_order, b.completion_order);
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);

        let mut c = ExecutionResult::empty("s", "x");
        c.push_unit(unit("one", true, 1));
        c.push_unit(unit("two", true, 3));
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn failed_unit_marks_result_failed() {
        let mut r = ExecutionResult::empty("s", "x");
        r.push_unit(unit("ok", true, 1));
        r.push_unit(unit("bad", false, 2));
        assert!(!r.success);
        assert_eq!(r.failed_units(), vec!["bad"]);
        assert_eq!(r.errors, vec!["bad: exited with code 2: boom".to_string()]);
    }

    #[test]
    fn merge_accumulates() {
        let mut stage = ExecutionResult::empty("s", "x");
        let mut p1 = ExecutionResult::empty("s", "x");
        p1.push_unit(unit("a", true, 1));
        p1.parallelism_achieved = 3;
        p1.execution_time = Duration::from_millis(10);
        let mut p2 = ExecutionResult::empty("s", "x");
        p2.push_unit(unit("b", false, 2));
        p2.parallelism_achieved = 1;
        p2.execution_time = Duration::from_millis(5);

        stage.merge(p1);
        stage.merge(p2);
        assert!(!stage.success);
        assert_eq!(stage.unit_results.len(), 2);
        assert_eq!(stage.parallelism_achieved, 3);
        assert_eq!(stage.execution_time, Duration::from_millis(15));
        assert_eq!(stage.completion_order, vec!["a", "b"]);
    }

    #[test]
    fn request_builds_context_with_supplied_id() {
        let req = StageRequest::new("foundation", &["a"])
            .with_year(2025)
            .with_variable("scenario", "baseline")
            .with_execution_id("run-1");
        let ctx = req.context();
        assert_eq!(ctx.execution_id, "run-1");
        assert_eq!(ctx.simulation_year, 2025);
        assert_eq!(ctx.variables["scenario"], "baseline");
        assert_ne!(StageRequest::new("s", &[]).context().execution_id, "");
    }
}
