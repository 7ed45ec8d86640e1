use std::sync::{Arc, Mutex};

use stagecoach_core::config::EngineConfig;
use stagecoach_core::{Executor, Result};
use stagecoach_graph::{DependencyAnalyzer, ExecutionPlan, SafetyReport};
use stagecoach_resources::ResourceManager;
use tracing::info;

use crate::state::{lock_state, EngineState, ScalingEvent};
use crate::stats::ParallelizationStatistics;

/// Runs stages of units against an [`Executor`], parallelizing where the
/// dependency analyzer allows and resources permit.
pub struct ParallelExecutionEngine {
    pub(super) config: EngineConfig,
    pub(super) analyzer: Arc<DependencyAnalyzer>,
    pub(super) executor: Arc<dyn Executor>,
    /// Optional; without it the engine never adapts or diverts.
    pub(super) resources: Option<Arc<ResourceManager>>,
    /// Active-execution registry and scaling history.
    pub(super) state: Mutex<EngineState>,
}

impl ParallelExecutionEngine {
    /// Fails with a configuration error on out-of-range worker bounds.
    pub fn new(
        config: EngineConfig,
        analyzer: Arc<DependencyAnalyzer>,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            max_workers = config.max_workers,
            min_workers = config.min_workers,
            deterministic = config.deterministic,
            adaptive_scaling = config.adaptive_scaling,
            "execution engine ready"
        );
        Ok(Self {
            state: Mutex::new(EngineState::new(config.max_workers)),
            config,
            analyzer,
            executor,
            resources: None,
        })
    }

    /// Attach a resource manager for health checks and adaptive sizing.
    pub fn with_resource_manager(mut self, resources: Arc<ResourceManager>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Engine settings as validated at construction.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Analyzer used for planning and pre-dispatch validation.
    pub fn analyzer(&self) -> &DependencyAnalyzer {
        &self.analyzer
    }

    /// The attached resource manager, if any.
    pub fn resource_manager(&self) -> Option<&Arc<ResourceManager>> {
        self.resources.as_ref()
    }

    /// Plan `units` the way `execute_stage` would. Batches are capped by
    /// `max_batch_size`, not by the worker count, so the plan (and every
    /// seed derived from it) is the same for any number of workers.
    pub fn plan(&self, units: &[String], allow_conditional: bool) -> ExecutionPlan {
        self.analyzer
            .create_execution_plan(units, self.config.max_batch_size, allow_conditional)
    }

    /// Strict pairwise safety check of `units` as one batch.
    pub fn validate(&self, units: &[String]) -> SafetyReport {
        self.analyzer.validate_execution_safety(units)
    }

    /// Informational plan statistics; never used to gate execution.
    pub fn get_parallelization_statistics(
        &self,
        units: &[String],
        allow_conditional: bool,
    ) -> ParallelizationStatistics {
        let plan = self.plan(units, allow_conditional);
        ParallelizationStatistics::from_plan(&plan, self.analyzer.classifier(), self.config.max_workers)
    }

    /// Every sizing decision taken so far, oldest first.
    pub fn scaling_history(&self) -> Vec<ScalingEvent> {
        lock_state(&self.state).scaling_history().to_vec()
    }

    /// Stages and units currently registered as running.
    pub fn active_executions(&self) -> usize {
        lock_state(&self.state).active_count()
    }

    /// Worker count applied to the most recent parallel phase.
    pub fn current_workers(&self) -> usize {
        lock_state(&self.state).current_workers()
    }
}
