use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::time::Instant;

use chrono::Utc;
use rayon::prelude::*;
use stagecoach_core::{ExecutionContext, Result, StagecoachError};
use tracing::{debug, error, warn};

use crate::result::{ExecutionResult, UnitResult};
use crate::state::{lock_state, Registration, ScalingEvent};

use super::ParallelExecutionEngine;

impl ParallelExecutionEngine {
    /// Worker count for a parallel phase: `min(units, effective max)`, where
    /// the effective max comes from the thread adjuster when adaptive
    /// scaling is on and a resource manager is attached.
    pub(super) fn phase_workers(&self, index: usize, units: usize, stage: &str) -> usize {
        let mut effective = self.config.max_workers;
        if self.config.adaptive_scaling {
            if let Some(resources) = &self.resources {
                let current = lock_state(&self.state).current_workers();
                let decision = resources.recommend_threads_within(
                    current,
                    self.config.min_workers,
                    self.config.max_workers,
                );
                let applied = decision.recommended;
                lock_state(&self.state).record_scaling(ScalingEvent {
                    timestamp: Utc::now(),
                    stage: stage.to_string(),
                    phase: index,
                    previous: decision.previous,
                    recommended: decision.recommended,
                    applied,
                    critical: decision.critical,
                    reason: decision.reason,
                });
                effective = applied;
            }
        }
        units.min(effective).max(1)
    }

    /// Run a batch on a pool of exactly `workers` threads.
    ///
    /// Deterministic mode sorts the batch, dispatches by ordinal and merges
    /// results in ordinal order once every unit has finished. Otherwise
    /// results are merged in completion order.
    pub(super) fn dispatch(
        &self,
        index: usize,
        units: &[String],
        workers: usize,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult> {
        let mut ordered = units.to_vec();
        if self.config.deterministic {
            ordered.sort();
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(move |i| format!("stagecoach-p{index}-w{i}"))
            .build()
            .map_err(|e| StagecoachError::Io(io::Error::other(e)))?;

        let results: Vec<UnitResult> = if self.config.deterministic {
            pool.install(|| {
                ordered
                    .par_iter()
                    .enumerate()
                    .map(|(ordinal, unit)| self.run_unit(index, ordinal, unit, ctx))
                    .collect::<Result<Vec<_>>>()
            })?
        } else {
            let (tx, rx) = mpsc::channel();
            pool.scope(|scope| {
                for (ordinal, unit) in ordered.iter().enumerate() {
                    let tx = tx.clone();
                    scope.spawn(move |_| {
                        // The receiver outlives the scope.
                        let _ = tx.send(self.run_unit(index, ordinal, unit, ctx));
                    });
                }
            });
            drop(tx);
            rx.into_iter().collect::<Result<Vec<_>>>()?
        };

        let mut result = ExecutionResult::empty(&ctx.stage, &ctx.execution_id);
        for unit_result in results {
            result.push_unit(unit_result);
        }
        for unit in &ordered {
            if !result.unit_results.contains_key(unit) {
                result.success = false;
                result.errors.push(format!("{unit}: no result"));
            }
        }
        Ok(result)
    }

    /// Execute one unit with its own context clone. Executor errors and
    /// panics become failed results; only a duplicate registration is `Err`.
    pub(super) fn run_unit(
        &self,
        phase: usize,
        ordinal: usize,
        unit: &str,
        ctx: &ExecutionContext,
    ) -> Result<UnitResult> {
        let mut unit_ctx = ctx.for_unit(phase, ordinal, unit, self.config.base_seed);
        if !self.config.deterministic {
            unit_ctx.seed = None;
        }
        let _registration = Registration::acquire(&self.state, &unit_ctx.execution_id)?;
        let variables = unit_ctx.executor_variables();

        debug!(unit, execution_id = %unit_ctx.execution_id, seed = ?unit_ctx.seed, "dispatching unit");
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.executor.execute(unit, &variables, unit_ctx.seed)
        }));
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(Ok(outcome)) => UnitResult::from_outcome(&unit_ctx, unit, phase, ordinal, outcome),
            Ok(Err(e)) => UnitResult::from_error(&unit_ctx, unit, phase, ordinal, e.to_string(), elapsed),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(unit, %message, "executor panicked");
                UnitResult::from_error(
                    &unit_ctx,
                    unit,
                    phase,
                    ordinal,
                    format!("executor panicked: {message}"),
                    elapsed,
                )
            }
        };

        if result.success {
            debug!(unit, elapsed_ms = elapsed.as_millis() as u64, "unit succeeded");
        } else {
            warn!(unit, return_code = result.return_code, error = ?result.error, "unit failed");
        }
        Ok(result)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
