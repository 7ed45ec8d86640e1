use serde::Serialize;
use stagecoach_core::UnitClassifier;
use stagecoach_graph::ExecutionPlan;

/// Informational plan metrics. Never used to gate execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParallelizationStatistics {
    pub total_units: usize,
    pub parallel_safe: usize,
    pub sequential: usize,
    pub conditional: usize,
    pub parallel_groups: usize,
    pub parallel_phases: usize,
    pub units_in_parallel_phases: usize,
    /// Share of units scheduled into parallel phases.
    pub parallelization_ratio: f64,
    /// Steps if every parallel phase ran at `max_workers`.
    pub serial_steps: usize,
    pub theoretical_max_speedup: f64,
    pub max_workers: usize,
}

impl ParallelizationStatistics {
    pub fn from_plan(plan: &ExecutionPlan, classifier: &UnitClassifier, max_workers: usize) -> Self {
        let units = plan.units();
        let workers = max_workers.max(1);
        let total_units = units.len();

        let mut units_in_parallel_phases = 0;
        let mut serial_steps = 0;
        for phase in &plan.phases {
            let n = phase.units().len();
            if phase.is_parallel() {
                units_in_parallel_phases += n;
                serial_steps += n.div_ceil(workers);
            } else {
                serial_steps += n;
            }
        }

        let parallelization_ratio = if total_units == 0 {
            0.0
        } else {
            units_in_parallel_phases as f64 / total_units as f64
        };
        let theoretical_max_speedup = if serial_steps == 0 {
            1.0
        } else {
            total_units as f64 / serial_steps as f64
        };

        Self {
            total_units,
            parallel_safe: classifier.get_parallel_safe(&units).len(),
            sequential: classifier.get_sequential(&units).len(),
            conditional: classifier.get_conditional(&units).len(),
            parallel_groups: classifier.get_parallel_groups(&units).len(),
            parallel_phases: plan.parallel_phases(),
            units_in_parallel_phases,
            parallelization_ratio,
            serial_steps,
            theoretical_max_speedup,
            max_workers: workers,
        }
    }
}
