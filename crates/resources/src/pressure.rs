use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Headroom classification for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    None,
    Moderate,
    High,
    Critical,
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PressureLevel::None => "none",
            PressureLevel::Moderate => "moderate",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Three ascending thresholds. A value at or above a threshold takes its level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub moderate: f64,
    pub high: f64,
    pub critical: f64,
}

impl Thresholds {
    pub fn new(moderate: f64, high: f64, critical: f64) -> Self {
        Self { moderate, high, critical }
    }

    pub fn classify(&self, value: f64) -> PressureLevel {
        if value >= self.critical {
            PressureLevel::Critical
        } else if value >= self.high {
            PressureLevel::High
        } else if value >= self.moderate {
            PressureLevel::Moderate
        } else {
            PressureLevel::None
        }
    }
}

/// Point-in-time view of memory and CPU pressure. Computed on demand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourcePressure {
    pub memory: PressureLevel,
    pub cpu: PressureLevel,
    pub memory_mb: f64,
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub leak_suspected: bool,
    pub recommended_thread_delta: i32,
    pub timestamp: DateTime<Utc>,
}

impl ResourcePressure {
    pub fn new(memory: PressureLevel, cpu: PressureLevel) -> Self {
        Self {
            memory,
            cpu,
            memory_mb: 0.0,
            memory_percent: 0.0,
            cpu_percent: 0.0,
            leak_suspected: false,
            recommended_thread_delta: recommended_thread_delta(memory, cpu),
            timestamp: Utc::now(),
        }
    }

    /// Nothing to worry about; used when no resource manager is attached.
    pub fn relaxed() -> Self {
        Self::new(PressureLevel::None, PressureLevel::None)
    }

    pub fn is_critical(&self) -> bool {
        self.memory == PressureLevel::Critical || self.cpu == PressureLevel::Critical
    }

    pub fn worst(&self) -> PressureLevel {
        self.memory.max(self.cpu)
    }
}

/// Thread delta implied by pressure alone: shed aggressively when critical,
/// shed one when high, hold when moderate, allow one more when idle.
pub fn recommended_thread_delta(memory: PressureLevel, cpu: PressureLevel) -> i32 {
    let memory_delta = match memory {
        PressureLevel::Critical => -3,
        PressureLevel::High => -1,
        PressureLevel::Moderate => 0,
        PressureLevel::None => 1,
    };
    let cpu_delta = match cpu {
        PressureLevel::Critical => -2,
        PressureLevel::High => -1,
        PressureLevel::Moderate => 0,
        PressureLevel::None => 1,
    };
    memory_delta.min(cpu_delta)
}
