//! Parallel execution engine.
//!
//! Split into focused submodules:
//! - `core`: engine struct, constructor, planning and accessor methods
//! - `execution`: per-stage state machine (plan, phases, aggregate)
//! - `dispatch`: worker pool sizing and unit dispatch for one phase

mod core;
mod dispatch;
mod execution;

pub use self::core::ParallelExecutionEngine;
