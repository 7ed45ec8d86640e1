use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use stagecoach_core::config::ResourceConfig;

use crate::lock;
use crate::pressure::{PressureLevel, Thresholds};
use crate::probe::SystemProbe;
use crate::sampler::Sampler;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuSnapshot {
    pub timestamp: DateTime<Utc>,
    pub percent: f64,
    pub level: PressureLevel,
}

struct CpuState {
    probe: Box<dyn SystemProbe>,
    history: VecDeque<CpuSnapshot>,
    last_sampled: Option<Instant>,
}

/// Samples global CPU utilisation into a bounded history.
#[derive(Clone)]
pub struct CpuMonitor {
    thresholds: Thresholds,
    interval: Duration,
    capacity: usize,
    state: Arc<Mutex<CpuState>>,
}

impl CpuMonitor {
    pub fn new(config: &ResourceConfig, probe: impl SystemProbe + 'static) -> Self {
        let capacity = config.history_size.max(1);
        Self {
            thresholds: Thresholds::new(
                config.cpu_moderate_percent,
                config.cpu_high_percent,
                config.cpu_critical_percent,
            ),
            interval: Duration::from_millis(config.sample_interval_ms),
            capacity,
            state: Arc::new(Mutex::new(CpuState {
                probe: Box::new(probe),
                history: VecDeque::with_capacity(capacity),
                last_sampled: None,
            })),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn sample(&self) -> CpuSnapshot {
        {
            let state = lock(&self.state);
            if let (Some(at), Some(latest)) = (state.last_sampled, state.history.back()) {
                if at.elapsed() < self.interval {
                    return latest.clone();
                }
            }
        }
        self.sample_now()
    }

    pub fn sample_now(&self) -> CpuSnapshot {
        let mut state = lock(&self.state);
        let percent = state.probe.cpu_percent();
        let snapshot = CpuSnapshot {
            timestamp: Utc::now(),
            percent,
            level: self.thresholds.classify(percent),
        };
        while state.history.len() >= self.capacity {
            state.history.pop_front();
        }
        state.history.push_back(snapshot.clone());
        state.last_sampled = Some(Instant::now());
        snapshot
    }

    pub fn level(&self) -> PressureLevel {
        self.sample().level
    }

    pub fn history(&self) -> Vec<CpuSnapshot> {
        lock(&self.state).history.iter().cloned().collect()
    }

    /// Mean utilisation over the last `window` samples, if any.
    pub fn average(&self, window: usize) -> Option<f64> {
        let state = lock(&self.state);
        let n = window.min(state.history.len());
        if n == 0 {
            return None;
        }
        let sum: f64 = state.history.iter().rev().take(n).map(|s| s.percent).sum();
        Some(sum / n as f64)
    }

    pub fn spawn_sampler(&self) -> io::Result<Sampler> {
        let monitor = self.clone();
        Sampler::spawn("cpu-monitor", self.interval, move || {
            monitor.sample_now();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::StaticProbe;

    fn config() -> ResourceConfig {
        ResourceConfig {
            history_size: 3,
            sample_interval_ms: 60_000,
            ..ResourceConfig::default()
        }
    }

    #[test]
    fn classifies_cpu_levels() {
        let probe = StaticProbe::new(0.0, 10.0);
        let monitor = CpuMonitor::new(&config(), probe.clone());
        assert_eq!(monitor.sample_now().level, PressureLevel::None);
        probe.set_cpu_percent(72.0);
        assert_eq!(monitor.sample_now().level, PressureLevel::Moderate);
        probe.set_cpu_percent(90.0);
        assert_eq!(monitor.sample_now().level, PressureLevel::High);
        probe.set_cpu_percent(99.0);
        assert_eq!(monitor.sample_now().level, PressureLevel::Critical);
    }

    #[test]
    fn average_over_bounded_history() {
        let probe = StaticProbe::new(0.0, 0.0);
        let monitor = CpuMonitor::new(&config(), probe.clone());
        assert_eq!(monitor.average(5), None);
        for pct in [10.0, 20.0, 30.0, 40.0] {
            probe.set_cpu_percent(pct);
            monitor.sample_now();
        }
        assert_eq!(monitor.history().len(), 3);
        assert_eq!(monitor.average(2), Some(35.0));
        assert_eq!(monitor.average(10), Some(30.0));
    }

    #[test]
    fn cached_sample_within_interval() {
        let probe = StaticProbe::new(0.0, 5.0);
        let monitor = CpuMonitor::new(&config(), probe.clone());
        monitor.sample();
        probe.set_cpu_percent(99.0);
        assert_eq!(monitor.level(), PressureLevel::None);
    }
}
