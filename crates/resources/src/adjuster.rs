//! Adaptive worker sizing.
//!
//! Two estimates are combined by minimum: one from current resource pressure,
//! one from how fast recent executions ran at each thread count. The
//! performance estimate moves at most one thread per decision.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use stagecoach_core::config::AdjusterConfig;

use crate::pressure::ResourcePressure;

/// Outcome of one sizing decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadDecision {
    pub previous: usize,
    pub recommended: usize,
    pub resource_estimate: usize,
    pub performance_estimate: usize,
    pub critical: bool,
    pub reason: String,
}

impl ThreadDecision {
    pub fn changed(&self) -> bool {
        self.previous != self.recommended
    }
}

/// Rolling execution times per thread count.
#[derive(Debug, Clone, Default)]
pub struct PerformanceHistory {
    window: usize,
    by_threads: BTreeMap<usize, VecDeque<Duration>>,
}

impl PerformanceHistory {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            by_threads: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, threads: usize, elapsed: Duration) {
        let samples = self.by_threads.entry(threads).or_default();
        if samples.len() >= self.window {
            samples.pop_front();
        }
        samples.push_back(elapsed);
    }

    pub fn samples(&self, threads: usize) -> usize {
        self.by_threads.get(&threads).map_or(0, VecDeque::len)
    }

    pub fn average(&self, threads: usize) -> Option<Duration> {
        let samples = self.by_threads.get(&threads)?;
        if samples.is_empty() {
            return None;
        }
        let total: Duration = samples.iter().sum();
        Some(total / samples.len() as u32)
    }

    /// Thread count with the lowest average among counts with at least
    /// `min_samples` recorded executions. Ties go to fewer threads.
    pub fn fastest(&self, min_samples: usize) -> Option<usize> {
        self.by_threads
            .keys()
            .filter(|t| self.samples(**t) >= min_samples.max(1))
            .filter_map(|t| self.average(*t).map(|avg| (*t, avg)))
            .min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
            .map(|(t, _)| t)
    }
}

pub fn resource_estimate(current: usize, pressure: &ResourcePressure) -> usize {
    let delta = pressure.recommended_thread_delta;
    if delta >= 0 {
        current.saturating_add(delta as usize)
    } else {
        current.saturating_sub(delta.unsigned_abs() as usize)
    }
}

pub fn performance_estimate(current: usize, history: &PerformanceHistory, min_samples: usize) -> usize {
    match history.fastest(min_samples) {
        Some(best) if best > current => current + 1,
        Some(best) if best < current => current - 1,
        _ => current,
    }
}

/// Pure sizing decision. `last_adjustment` is when the count last changed.
pub fn recommend(
    config: &AdjusterConfig,
    current: usize,
    history: &PerformanceHistory,
    pressure: &ResourcePressure,
    last_adjustment: Option<Instant>,
    now: Instant,
) -> ThreadDecision {
    let min = config.min_threads.max(1);
    let max = config.max_threads.max(min);
    let critical = pressure.is_critical();
    let resource = resource_estimate(current, pressure);
    let performance = performance_estimate(current, history, config.min_samples);

    let cooling = last_adjustment
        .is_some_and(|at| now.saturating_duration_since(at) < Duration::from_secs(config.cooldown_secs));

    let (recommended, reason) = if cooling && !critical {
        (current.clamp(min, max), "cooldown active".to_string())
    } else {
        let combined = resource.min(performance).clamp(min, max);
        let reason = if critical {
            format!(
                "critical pressure (memory {}, cpu {})",
                pressure.memory, pressure.cpu
            )
        } else if combined < current {
            if resource <= performance {
                format!("{} pressure", pressure.worst())
            } else {
                "fewer threads ran faster".to_string()
            }
        } else if combined > current {
            "more threads ran faster".to_string()
        } else {
            "steady".to_string()
        };
        (combined, reason)
    };

    ThreadDecision {
        previous: current,
        recommended,
        resource_estimate: resource,
        performance_estimate: performance,
        critical,
        reason,
    }
}

/// Stateful wrapper that remembers execution history and the last change.
#[derive(Debug, Clone)]
pub struct AdaptiveThreadAdjuster {
    config: AdjusterConfig,
    history: PerformanceHistory,
    last_adjustment: Option<Instant>,
}

impl AdaptiveThreadAdjuster {
    pub fn new(config: &AdjusterConfig) -> Self {
        Self {
            config: config.clone(),
            history: PerformanceHistory::new(config.history_window),
            last_adjustment: None,
        }
    }

    pub fn config(&self) -> &AdjusterConfig {
        &self.config
    }

    pub fn history(&self) -> &PerformanceHistory {
        &self.history
    }

    pub fn record_execution(&mut self, threads: usize, elapsed: Duration) {
        self.history.record(threads, elapsed);
    }

    pub fn decide(&mut self, current: usize, pressure: &ResourcePressure) -> ThreadDecision {
        self.decide_at(current, pressure, Instant::now())
    }

    pub fn decide_at(&mut self, current: usize, pressure: &ResourcePressure, now: Instant) -> ThreadDecision {
        let decision = recommend(
            &self.config,
            current,
            &self.history,
            pressure,
            self.last_adjustment,
            now,
        );
        self.settle(decision, now)
    }

    /// Decide within the caller's `min..=max` as well as the configured
    /// bounds, so the recorded decision is the count the caller applies.
    pub fn decide_within(
        &mut self,
        current: usize,
        pressure: &ResourcePressure,
        min: usize,
        max: usize,
    ) -> ThreadDecision {
        self.decide_within_at(current, pressure, min, max, Instant::now())
    }

    pub fn decide_within_at(
        &mut self,
        current: usize,
        pressure: &ResourcePressure,
        min: usize,
        max: usize,
        now: Instant,
    ) -> ThreadDecision {
        let config = narrowed(&self.config, min, max);
        let decision = recommend(&config, current, &self.history, pressure, self.last_adjustment, now);
        self.settle(decision, now)
    }

    fn settle(&mut self, decision: ThreadDecision, now: Instant) -> ThreadDecision {
        if decision.changed() {
            self.last_adjustment = Some(now);
        }
        decision
    }
}

/// Intersect the configured bounds with `min..=max`. Disjoint ranges fall
/// back to the caller's bounds.
fn narrowed(config: &AdjusterConfig, min: usize, max: usize) -> AdjusterConfig {
    let min = min.max(1);
    let max = max.max(min);
    let lo = config.min_threads.max(min);
    let hi = config.max_threads.min(max);
    let (min_threads, max_threads) = if lo <= hi { (lo, hi) } else { (min, max) };
    AdjusterConfig {
        min_threads,
        max_threads,
        ..config.clone()
    }
}
