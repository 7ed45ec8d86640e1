use std::io;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use stagecoach_core::config::{AdjusterConfig, ResourceConfig};
use tracing::{info, warn};

use crate::adjuster::{AdaptiveThreadAdjuster, ThreadDecision};
use crate::cpu::CpuMonitor;
use crate::lock;
use crate::memory::MemoryMonitor;
use crate::pressure::{recommended_thread_delta, PressureLevel, ResourcePressure};
use crate::probe::{SysinfoProbe, SystemProbe};
use crate::sampler::Sampler;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub pressure: ResourcePressure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupReport {
    pub before_mb: f64,
    pub after_mb: f64,
    pub freed_mb: f64,
    pub reclaimed_bytes: u64,
    pub effective: bool,
}

/// Single entry point the engine consults between phases.
pub struct ResourceManager {
    config: ResourceConfig,
    memory: MemoryMonitor,
    cpu: CpuMonitor,
    adjuster: Mutex<AdaptiveThreadAdjuster>,
    last_levels: Mutex<Option<(PressureLevel, PressureLevel)>>,
    samplers: Mutex<Vec<Sampler>>,
}

impl ResourceManager {
    pub fn new(
        resources: &ResourceConfig,
        adjuster: &AdjusterConfig,
        memory_probe: impl SystemProbe + 'static,
        cpu_probe: impl SystemProbe + 'static,
    ) -> Self {
        Self {
            config: resources.clone(),
            memory: MemoryMonitor::new(resources, memory_probe),
            cpu: CpuMonitor::new(resources, cpu_probe),
            adjuster: Mutex::new(AdaptiveThreadAdjuster::new(adjuster)),
            last_levels: Mutex::new(None),
            samplers: Mutex::new(Vec::new()),
        }
    }

    /// Backed by live operating-system readings.
    pub fn with_system_probes(resources: &ResourceConfig, adjuster: &AdjusterConfig) -> Self {
        Self::new(resources, adjuster, SysinfoProbe::new(), SysinfoProbe::new())
    }

    /// Memory monitor, for history and trend queries.
    pub fn memory(&self) -> &MemoryMonitor {
        &self.memory
    }

    /// CPU monitor, for history and average queries.
    pub fn cpu(&self) -> &CpuMonitor {
        &self.cpu
    }

    /// Sample both monitors (cached within the interval) and log level changes.
    pub fn current_pressure(&self) -> ResourcePressure {
        let memory = self.memory.sample();
        let cpu = self.cpu.sample();
        let trend = self.memory.trend();
        self.note_transition(memory.level, cpu.level);
        ResourcePressure {
            memory: memory.level,
            cpu: cpu.level,
            memory_mb: memory.used_mb,
            memory_percent: memory.system_percent,
            cpu_percent: cpu.percent,
            leak_suspected: trend.leak_suspected,
            recommended_thread_delta: recommended_thread_delta(memory.level, cpu.level),
            timestamp: memory.timestamp,
        }
    }

    fn note_transition(&self, memory: PressureLevel, cpu: PressureLevel) {
        let mut last = lock(&self.last_levels);
        let (prev_memory, prev_cpu) = last.unwrap_or((PressureLevel::None, PressureLevel::None));
        for (resource, from, to) in [("memory", prev_memory, memory), ("cpu", prev_cpu, cpu)] {
            if from == to {
                continue;
            }
            if to == PressureLevel::Critical {
                warn!(resource, %from, %to, "resource pressure changed");
            } else {
                info!(resource, %from, %to, "resource pressure changed");
            }
        }
        *last = Some((memory, cpu));
    }

    /// Healthy unless memory or CPU pressure is critical.
    pub fn health_check(&self) -> HealthStatus {
        let pressure = self.current_pressure();
        HealthStatus {
            healthy: !pressure.is_critical(),
            pressure,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health_check().healthy
    }

    /// Force a collection and measure what it freed.
    pub fn trigger_cleanup(&self) -> CleanupReport {
        let before_mb = self.memory.sample_now().used_mb;
        let reclaimed_bytes = self.memory.collect();
        let after_mb = self.memory.sample_now().used_mb;
        let freed_mb = (before_mb - after_mb).max(0.0);
        let effective = freed_mb >= self.config.cleanup_effective_mb;
        info!(freed_mb, reclaimed_bytes, effective, "cleanup triggered");
        CleanupReport {
            before_mb,
            after_mb,
            freed_mb,
            reclaimed_bytes,
            effective,
        }
    }

    /// Hook run on every collection; returns bytes released.
    pub fn register_reclaimer<F>(&self, name: &str, reclaim: F)
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        self.memory.register_reclaimer(name, reclaim);
    }

    /// Ask the adjuster for a worker count given current pressure.
    pub fn recommend_threads(&self, current: usize) -> ThreadDecision {
        let pressure = self.current_pressure();
        let decision = lock(&self.adjuster).decide(current, &pressure);
        log_decision(&decision);
        decision
    }

    /// Like [`recommend_threads`](Self::recommend_threads), confined to the
    /// caller's worker bounds.
    pub fn recommend_threads_within(&self, current: usize, min: usize, max: usize) -> ThreadDecision {
        let pressure = self.current_pressure();
        let decision = lock(&self.adjuster).decide_within(current, &pressure, min, max);
        log_decision(&decision);
        decision
    }

    /// Feed one phase's wall time into the adjuster's performance history.
    pub fn record_execution(&self, threads: usize, elapsed: Duration) {
        lock(&self.adjuster).record_execution(threads, elapsed);
    }

    /// Start background sampling for both monitors. Idempotent.
    pub fn start_monitoring(&self) -> io::Result<()> {
        let mut samplers = lock(&self.samplers);
        if !samplers.is_empty() {
            return Ok(());
        }
        samplers.push(self.memory.spawn_sampler()?);
        samplers.push(self.cpu.spawn_sampler()?);
        info!(interval_ms = self.config.sample_interval_ms, "resource monitoring started");
        Ok(())
    }

    /// Stop and join the samplers. Idempotent.
    pub fn stop_monitoring(&self) {
        let mut samplers = lock(&self.samplers);
        if samplers.is_empty() {
            return;
        }
        for sampler in samplers.iter_mut() {
            sampler.stop();
        }
        samplers.clear();
        info!("resource monitoring stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        !lock(&self.samplers).is_empty()
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

fn log_decision(decision: &ThreadDecision) {
    if decision.changed() {
        info!(
            old = decision.previous,
            new = decision.recommended,
            reason = %decision.reason,
            "thread count adjusted"
        );
    }
}
