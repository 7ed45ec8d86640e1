//! Stage execution: turns a plan from the dependency analyzer into parallel
//! and sequential phases, dispatches units to the executor and aggregates
//! their results.

pub mod engine;
pub mod result;
pub mod state;
pub mod stats;

pub use engine::ParallelExecutionEngine;
pub use result::{ExecutionResult, PhaseSummary, StageRequest, UnitResult};
pub use state::ScalingEvent;
pub use stats::ParallelizationStatistics;
