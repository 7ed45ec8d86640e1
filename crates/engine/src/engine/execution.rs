use std::time::Instant;

use stagecoach_core::{ExecutionContext, Result, StagecoachError};
use stagecoach_graph::{ExecutionPhase, ExecutionPlan};
use stagecoach_resources::ResourcePressure;
use tracing::{error, info, warn};

use crate::result::{ExecutionResult, PhaseSummary, StageRequest};
use crate::state::Registration;

use super::ParallelExecutionEngine;

impl ParallelExecutionEngine {
    /// Run one stage: plan, then each phase in order, stopping at the first
    /// failed phase.
    ///
    /// Structural problems (a dependency cycle, a duplicate execution id)
    /// are returned as `Err`. Unit failures are reported in the result.
    pub fn execute_stage(&self, request: &StageRequest) -> Result<ExecutionResult> {
        let plan = self.plan(&request.units, request.allow_conditional);
        self.execute_plan(request, &plan)
    }

    /// Run a plan produced earlier, e.g. one that was inspected first.
    /// Parallel phases are still re-validated before dispatch.
    pub fn execute_plan(&self, request: &StageRequest, plan: &ExecutionPlan) -> Result<ExecutionResult> {
        let ctx = request.context();
        let _registration = Registration::acquire(&self.state, &ctx.execution_id)?;
        let started = Instant::now();

        if let Some(cycle) = &plan.ordering_fallback {
            error!(stage = %ctx.stage, units = ?cycle.units, "dependency cycle, refusing to run stage");
            return Err(cycle.clone().into());
        }
        info!(
            stage = %ctx.stage,
            execution_id = %ctx.execution_id,
            units = plan.unit_count(),
            phases = plan.phases.len(),
            parallel_phases = plan.parallel_phases(),
            "stage started"
        );

        let mut stage_result = ExecutionResult::empty(&ctx.stage, &ctx.execution_id);
        let mut completed = 0;
        for (index, phase) in plan.phases.iter().enumerate() {
            let phase_result = match phase {
                ExecutionPhase::Sequential { units, .. } => {
                    self.run_sequential_phase(index, units, &ctx, None)?
                }
                ExecutionPhase::Parallel { units, group, .. } => {
                    let report = self.analyzer.validate_phase_safety(units, request.allow_conditional);
                    if !report.safe {
                        let violation = StagecoachError::SafetyViolation(report.issues.join("; "));
                        warn!(
                            stage = %ctx.stage,
                            phase = index,
                            error = %violation,
                            "phase demoted to sequential"
                        );
                        let ordered = self.sequential_order(units)?;
                        self.run_sequential_phase(index, &ordered, &ctx, Some(violation.to_string()))?
                    } else if let Some(pressure) = self.critical_pressure() {
                        let remaining: Vec<String> = plan.phases[index..]
                            .iter()
                            .flat_map(|p| p.units().iter().cloned())
                            .collect();
                        let critical = StagecoachError::ResourceCritical(format!(
                            "memory {}, cpu {}",
                            pressure.memory, pressure.cpu
                        ));
                        warn!(
                            stage = %ctx.stage,
                            phase = index,
                            error = %critical,
                            remaining = remaining.len(),
                            "stage diverted to sequential fallback"
                        );
                        let ordered = self.sequential_order(&remaining)?;
                        let fallback =
                            self.run_sequential_phase(index, &ordered, &ctx, Some(critical.to_string()))?;
                        stage_result.merge(fallback);
                        completed = plan.phases.len();
                        break;
                    } else {
                        for warning in &report.warnings {
                            warn!(stage = %ctx.stage, phase = index, %warning, "phase safety warning");
                        }
                        self.run_parallel_phase(index, group, units, &ctx)?
                    }
                }
            };

            let ok = phase_result.success;
            stage_result.merge(phase_result);
            completed = index + 1;
            if !ok {
                error!(stage = %ctx.stage, phase = index, "phase failed, halting stage");
                break;
            }
        }

        let not_run: Vec<String> = plan.phases[completed..]
            .iter()
            .flat_map(|p| p.units().iter().cloned())
            .collect();
        if !not_run.is_empty() {
            stage_result.success = false;
            stage_result
                .errors
                .push(format!("stage halted, not run: {}", not_run.join(", ")));
        }

        stage_result.execution_time = started.elapsed();
        stage_result.resource_snapshot = self.resources.as_ref().map(|rm| rm.current_pressure());
        info!(
            stage = %ctx.stage,
            success = stage_result.success,
            units_run = stage_result.unit_results.len(),
            parallelism = stage_result.parallelism_achieved,
            elapsed_ms = stage_result.execution_time.as_millis() as u64,
            "stage finished"
        );
        Ok(stage_result)
    }

    fn critical_pressure(&self) -> Option<ResourcePressure> {
        let resources = self.resources.as_ref()?;
        let health = resources.health_check();
        if health.healthy {
            None
        } else {
            Some(health.pressure)
        }
    }

    fn sequential_order(&self, units: &[String]) -> Result<Vec<String>> {
        Ok(self.analyzer.topological_order(units)?)
    }

    fn run_parallel_phase(
        &self,
        index: usize,
        group: &str,
        units: &[String],
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult> {
        let workers = self.phase_workers(index, units.len(), &ctx.stage);
        info!(
            stage = %ctx.stage,
            phase = index,
            kind = "parallel",
            group,
            units = units.len(),
            workers,
            "phase started"
        );
        let started = Instant::now();
        let mut result = self.dispatch(index, units, workers, ctx)?;
        let elapsed = started.elapsed();
        if let Some(resources) = &self.resources {
            resources.record_execution(workers, elapsed);
        }

        result.execution_time = elapsed;
        result.parallelism_achieved = workers;
        result.phases.push(PhaseSummary {
            index,
            kind: "parallel".to_string(),
            units: units.to_vec(),
            workers,
            success: result.success,
            elapsed,
            demoted: None,
        });
        info!(
            stage = %ctx.stage,
            phase = index,
            success = result.success,
            elapsed_ms = elapsed.as_millis() as u64,
            "phase finished"
        );
        Ok(result)
    }

    /// Runs `units` in the given order, aborting at the first failure.
    fn run_sequential_phase(
        &self,
        index: usize,
        units: &[String],
        ctx: &ExecutionContext,
        demoted: Option<String>,
    ) -> Result<ExecutionResult> {
        info!(
            stage = %ctx.stage,
            phase = index,
            kind = "sequential",
            units = units.len(),
            "phase started"
        );
        let started = Instant::now();
        let mut result = ExecutionResult::empty(&ctx.stage, &ctx.execution_id);
        for (ordinal, unit) in units.iter().enumerate() {
            let unit_result = self.run_unit(index, ordinal, unit, ctx)?;
            let failed = !unit_result.success;
            result.push_unit(unit_result);
            if failed {
                let skipped = &units[ordinal + 1..];
                if !skipped.is_empty() {
                    result.errors.push(format!(
                        "sequential phase {index} aborted after {unit}, not run: {}",
                        skipped.join(", ")
                    ));
                }
                break;
            }
        }

        let elapsed = started.elapsed();
        result.execution_time = elapsed;
        result.parallelism_achieved = usize::from(!units.is_empty());
        result.phases.push(PhaseSummary {
            index,
            kind: "sequential".to_string(),
            units: units.to_vec(),
            workers: 1,
            success: result.success,
            elapsed,
            demoted,
        });
        info!(
            stage = %ctx.stage,
            phase = index,
            success = result.success,
            elapsed_ms = elapsed.as_millis() as u64,
            "phase finished"
        );
        Ok(result)
    }
}
