use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use stagecoach_core::config::ResourceConfig;
use tracing::{debug, info, warn};

use crate::lock;
use crate::pressure::{PressureLevel, Thresholds};
use crate::probe::SystemProbe;
use crate::sampler::Sampler;

/// Callback that drops a cache or buffer and reports the bytes it released.
pub type Reclaimer = Box<dyn Fn() -> u64 + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemorySnapshot {
    pub timestamp: DateTime<Utc>,
    pub used_mb: f64,
    pub system_percent: f64,
    pub level: PressureLevel,
}

/// Growth over the trailing leak window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryTrend {
    pub samples: usize,
    pub growth_mb_per_min: f64,
    pub peak_mb: f64,
    pub leak_suspected: bool,
}

impl MemoryTrend {
    fn empty() -> Self {
        Self {
            samples: 0,
            growth_mb_per_min: 0.0,
            peak_mb: 0.0,
            leak_suspected: false,
        }
    }
}

struct MemoryState {
    probe: Box<dyn SystemProbe>,
    history: VecDeque<MemorySnapshot>,
    last_sampled: Option<Instant>,
    above_gc_trigger: bool,
    collections: u64,
}

/// Samples process memory into a bounded history and classifies pressure.
///
/// Cheap to clone; clones share history, probe and reclaimers.
#[derive(Clone)]
pub struct MemoryMonitor {
    config: ResourceConfig,
    thresholds: Thresholds,
    state: Arc<Mutex<MemoryState>>,
    reclaimers: Arc<Mutex<Vec<(String, Reclaimer)>>>,
}

impl MemoryMonitor {
    pub fn new(config: &ResourceConfig, probe: impl SystemProbe + 'static) -> Self {
        Self {
            config: config.clone(),
            thresholds: Thresholds::new(
                config.memory_moderate_mb,
                config.memory_high_mb,
                config.memory_critical_mb,
            ),
            state: Arc::new(Mutex::new(MemoryState {
                probe: Box::new(probe),
                history: VecDeque::with_capacity(config.history_size),
                last_sampled: None,
                above_gc_trigger: false,
                collections: 0,
            })),
            reclaimers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.sample_interval_ms)
    }

    /// Latest sample, refreshed only when the cached one is older than the
    /// sample interval.
    pub fn sample(&self) -> MemorySnapshot {
        {
            let state = lock(&self.state);
            if let (Some(at), Some(latest)) = (state.last_sampled, state.history.back()) {
                if at.elapsed() < self.interval() {
                    return latest.clone();
                }
            }
        }
        self.sample_now()
    }

    /// Read the probe unconditionally and record the result.
    pub fn sample_now(&self) -> MemorySnapshot {
        let (snapshot, crossed_gc_trigger) = {
            let mut state = lock(&self.state);
            let used_mb = state.probe.process_memory_mb();
            let system_percent = state.probe.system_memory_percent();
            let snapshot = MemorySnapshot {
                timestamp: Utc::now(),
                used_mb,
                system_percent,
                level: self.thresholds.classify(used_mb),
            };
            while state.history.len() >= self.config.history_size.max(1) {
                state.history.pop_front();
            }
            state.history.push_back(snapshot.clone());
            state.last_sampled = Some(Instant::now());

            let above = used_mb >= self.config.gc_trigger_mb;
            let crossed = above && !state.above_gc_trigger;
            state.above_gc_trigger = above;
            (snapshot, crossed)
        };

        if crossed_gc_trigger {
            info!(
                used_mb = snapshot.used_mb,
                gc_trigger_mb = self.config.gc_trigger_mb,
                "memory crossed gc trigger, collecting"
            );
            self.collect();
        }
        snapshot
    }

    pub fn level(&self) -> PressureLevel {
        self.sample().level
    }

    pub fn history(&self) -> Vec<MemorySnapshot> {
        lock(&self.state).history.iter().cloned().collect()
    }

    pub fn trend(&self) -> MemoryTrend {
        let window = self.config.leak_window.max(2);
        let state = lock(&self.state);
        let skip = state.history.len().saturating_sub(window);
        let recent: Vec<MemorySnapshot> = state.history.iter().skip(skip).cloned().collect();
        drop(state);
        analyze_trend(&recent, &self.config)
    }

    pub fn register_reclaimer<F>(&self, name: &str, reclaim: F)
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        lock(&self.reclaimers).push((name.to_string(), Box::new(reclaim)));
        debug!(reclaimer = name, "reclaimer registered");
    }

    /// Run every registered reclaimer and trim the history down to the leak
    /// window. Returns the bytes the reclaimers report released.
    pub fn collect(&self) -> u64 {
        let mut released = 0u64;
        {
            let reclaimers = lock(&self.reclaimers);
            for (name, reclaim) in reclaimers.iter() {
                let bytes = reclaim();
                debug!(reclaimer = %name, bytes, "reclaimer ran");
                released = released.saturating_add(bytes);
            }
        }

        let mut state = lock(&self.state);
        let keep = self.config.leak_window.max(1);
        while state.history.len() > keep {
            state.history.pop_front();
        }
        state.history.shrink_to_fit();
        state.collections += 1;
        // Force the next on-demand sample to hit the probe.
        state.last_sampled = None;
        released
    }

    pub fn collections(&self) -> u64 {
        lock(&self.state).collections
    }

    /// Sample on a background thread at the configured interval.
    pub fn spawn_sampler(&self) -> io::Result<Sampler> {
        let monitor = self.clone();
        Sampler::spawn("memory-monitor", self.interval(), move || {
            monitor.sample_now();
        })
    }
}

/// Growth rate over `samples` (oldest first), and a leak verdict: sustained
/// growth above the configured rate with the peak already past the high
/// threshold.
pub fn analyze_trend(samples: &[MemorySnapshot], config: &ResourceConfig) -> MemoryTrend {
    let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
        return MemoryTrend::empty();
    };
    let peak_mb = samples.iter().map(|s| s.used_mb).fold(f64::MIN, f64::max);
    let minutes = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 60_000.0;
    let growth_mb_per_min = if minutes > 0.0 {
        (last.used_mb - first.used_mb) / minutes
    } else {
        0.0
    };

    let rising = samples
        .windows(2)
        .filter(|pair| pair[1].used_mb > pair[0].used_mb)
        .count();
    let sustained = samples.len() >= 3 && rising * 2 >= samples.len() - 1;

    let leak_suspected = sustained
        && growth_mb_per_min > config.leak_growth_mb_per_min
        && peak_mb > config.memory_high_mb;
    if leak_suspected {
        warn!(
            growth_mb_per_min,
            peak_mb,
            samples = samples.len(),
            "sustained memory growth above high threshold, possible leak"
        );
    }

    MemoryTrend {
        samples: samples.len(),
        growth_mb_per_min,
        peak_mb,
        leak_suspected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::StaticProbe;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> ResourceConfig {
        ResourceConfig {
            memory_moderate_mb: 100.0,
            memory_high_mb: 200.0,
            memory_critical_mb: 300.0,
            gc_trigger_mb: 150.0,
            leak_growth_mb_per_min: 10.0,
            leak_window: 4,
            history_size: 5,
            sample_interval_ms: 60_000,
            ..ResourceConfig::default()
        }
    }

    fn series(values: &[f64]) -> Vec<MemorySnapshot> {
        let start = Utc::now();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| MemorySnapshot {
                timestamp: start + ChronoDuration::seconds(60 * i as i64),
                used_mb: *v,
                system_percent: 0.0,
                level: PressureLevel::None,
            })
            .collect()
    }

    #[test]
    fn classifies_against_thresholds() {
        let probe = StaticProbe::new(50.0, 0.0);
        let monitor = MemoryMonitor::new(&config(), probe.clone());
        assert_eq!(monitor.sample_now().level, PressureLevel::None);
        probe.set_memory_mb(250.0);
        assert_eq!(monitor.sample_now().level, PressureLevel::High);
        probe.set_memory_mb(300.0);
        assert_eq!(monitor.sample_now().level, PressureLevel::Critical);
    }

    #[test]
    fn history_is_bounded() {
        let probe = StaticProbe::new(10.0, 0.0);
        let monitor = MemoryMonitor::new(&config(), probe.clone());
        for i in 0..12 {
            probe.set_memory_mb(10.0 + i as f64);
            monitor.sample_now();
        }
        let history = monitor.history();
        assert_eq!(history.len(), 5);
        assert_eq!(history.last().unwrap().used_mb, 21.0);
        assert_eq!(history.first().unwrap().used_mb, 17.0);
    }

    #[test]
    fn on_demand_sample_reuses_fresh_reading() {
        let probe = StaticProbe::new(10.0, 0.0);
        let monitor = MemoryMonitor::new(&config(), probe.clone());
        assert_eq!(monitor.sample().used_mb, 10.0);
        probe.set_memory_mb(99.0);
        // Interval is one minute, so the cached reading is returned.
        assert_eq!(monitor.sample().used_mb, 10.0);
        assert_eq!(monitor.history().len(), 1);
        assert_eq!(monitor.sample_now().used_mb, 99.0);
    }

    #[test]
    fn leak_needs_growth_and_high_peak() {
        let cfg = config();
        let leaking = analyze_trend(&series(&[180.0, 200.0, 220.0, 240.0]), &cfg);
        assert!(leaking.leak_suspected);
        assert!((leaking.growth_mb_per_min - 20.0).abs() < 1e-9);
        assert_eq!(leaking.peak_mb, 240.0);

        let low_peak = analyze_trend(&series(&[10.0, 30.0, 50.0, 70.0]), &cfg);
        assert!(!low_peak.leak_suspected);

        let slow = analyze_trend(&series(&[250.0, 251.0, 252.0, 253.0]), &cfg);
        assert!(!slow.leak_suspected);

        let spike = analyze_trend(&series(&[210.0, 210.0, 210.0, 290.0]), &cfg);
        assert!(!spike.leak_suspected, "one jump is not sustained growth");
    }

    #[test]
    fn empty_and_single_sample_trends() {
        let cfg = config();
        assert_eq!(analyze_trend(&[], &cfg).samples, 0);
        let one = analyze_trend(&series(&[500.0]), &cfg);
        assert_eq!(one.growth_mb_per_min, 0.0);
        assert!(!one.leak_suspected);
    }

    #[test]
    fn crossing_gc_trigger_runs_reclaimers_once() {
        let probe = StaticProbe::new(100.0, 0.0);
        let monitor = MemoryMonitor::new(&config(), probe.clone());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        monitor.register_reclaimer("cache", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            1024
        });

        monitor.sample_now();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        probe.set_memory_mb(160.0);
        monitor.sample_now();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        monitor.sample_now();
        assert_eq!(runs.load(Ordering::SeqCst), 1, "still above trigger, no new crossing");
        probe.set_memory_mb(120.0);
        monitor.sample_now();
        probe.set_memory_mb(170.0);
        monitor.sample_now();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(monitor.collections(), 2);
    }

    #[test]
    fn collect_trims_history_and_sums_released_bytes() {
        let probe = StaticProbe::new(10.0, 0.0);
        let monitor = MemoryMonitor::new(&config(), probe);
        monitor.register_reclaimer("a", || 100);
        monitor.register_reclaimer("b", || 28);
        for _ in 0..5 {
            monitor.sample_now();
        }
        assert_eq!(monitor.collect(), 128);
        assert_eq!(monitor.history().len(), 4);
    }

    #[test]
    fn background_sampler_fills_history() {
        let cfg = ResourceConfig {
            sample_interval_ms: 5,
            ..config()
        };
        let monitor = MemoryMonitor::new(&cfg, StaticProbe::new(10.0, 0.0));
        let mut sampler = monitor.spawn_sampler().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while monitor.history().len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        sampler.stop();
        assert!(monitor.history().len() >= 3);
    }
}
