//! Resource monitoring and adaptive worker sizing.
//!
//! - `memory` / `cpu`: samplers with bounded history and pressure classification
//! - `adjuster`: combines resource pressure and execution history into a thread count
//! - `benchmark`: measures a workload across candidate thread counts
//! - `manager`: one handle over all of the above for the execution engine

pub mod adjuster;
pub mod benchmark;
pub mod cpu;
pub mod manager;
pub mod memory;
pub mod pressure;
pub mod probe;
pub mod sampler;

use std::sync::{Mutex, MutexGuard};

pub use adjuster::{AdaptiveThreadAdjuster, PerformanceHistory, ThreadDecision};
pub use benchmark::{BenchmarkReport, BenchmarkSample, PerformanceBenchmarker};
pub use cpu::{CpuMonitor, CpuSnapshot};
pub use manager::{CleanupReport, HealthStatus, ResourceManager};
pub use memory::{MemoryMonitor, MemorySnapshot, MemoryTrend};
pub use pressure::{PressureLevel, ResourcePressure, Thresholds};
pub use probe::{StaticProbe, SysinfoProbe, SystemProbe};
pub use sampler::Sampler;

/// Acquire a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("mutex poisoned, recovering");
        poisoned.into_inner()
    })
}
