use std::time::{Duration, Instant};

use serde::Serialize;
use stagecoach_core::{Result, StagecoachError};
use tracing::{info, warn};

use crate::probe::SystemProbe;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkSample {
    pub threads: usize,
    pub elapsed: Duration,
    pub memory_delta_mb: f64,
    pub cpu_percent: f64,
    pub speedup: f64,
    pub efficiency: f64,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkReport {
    pub baseline_threads: usize,
    pub samples: Vec<BenchmarkSample>,
    pub recommended_threads: usize,
}

/// Runs a workload at each candidate thread count and recommends the most
/// efficient one.
pub struct PerformanceBenchmarker {
    probe: Box<dyn SystemProbe>,
    repetitions: usize,
}

impl PerformanceBenchmarker {
    pub fn new(probe: impl SystemProbe + 'static) -> Self {
        Self {
            probe: Box::new(probe),
            repetitions: 1,
        }
    }

    /// Time each thread count as the mean of `n` runs.
    pub fn with_repetitions(mut self, n: usize) -> Self {
        self.repetitions = n.max(1);
        self
    }

    /// The smallest candidate is the baseline. A failing candidate is
    /// recorded but never recommended; a failing baseline is an error.
    pub fn run<F>(&mut self, candidates: &[usize], mut workload: F) -> Result<BenchmarkReport>
    where
        F: FnMut(usize) -> Result<()>,
    {
        let mut counts: Vec<usize> = candidates.iter().copied().filter(|c| *c > 0).collect();
        counts.sort_unstable();
        counts.dedup();
        let Some(&baseline_threads) = counts.first() else {
            return Err(StagecoachError::Configuration(
                "benchmark needs at least one positive thread count".into(),
            ));
        };

        let mut samples = Vec::with_capacity(counts.len());
        let mut baseline_elapsed: Option<Duration> = None;

        for &threads in &counts {
            let memory_before = self.probe.process_memory_mb();
            let started = Instant::now();
            let mut failure = None;
            for _ in 0..self.repetitions {
                if let Err(e) = workload(threads) {
                    failure = Some(e.to_string());
                    break;
                }
            }
            let elapsed = (started.elapsed() / self.repetitions as u32).max(Duration::from_nanos(1));
            let memory_delta_mb = self.probe.process_memory_mb() - memory_before;
            let cpu_percent = self.probe.cpu_percent();

            if threads == baseline_threads {
                if let Some(message) = failure {
                    return Err(StagecoachError::UnitExecution {
                        unit: format!("benchmark@{threads}"),
                        message,
                    });
                }
                baseline_elapsed = Some(elapsed);
            }
            let base = baseline_elapsed.unwrap_or(elapsed);
            let speedup = base.as_secs_f64() / elapsed.as_secs_f64();
            let efficiency = speedup / (threads as f64 / baseline_threads as f64);

            if let Some(error) = &failure {
                warn!(threads, %error, "benchmark workload failed");
            } else {
                info!(
                    threads,
                    elapsed_ms = elapsed.as_millis() as u64,
                    speedup,
                    efficiency,
                    "benchmark sample"
                );
            }
            samples.push(BenchmarkSample {
                threads,
                elapsed,
                memory_delta_mb,
                cpu_percent,
                speedup,
                efficiency,
                success: failure.is_none(),
                error: failure,
            });
        }

        let recommended_threads = recommend_by_efficiency(&samples).unwrap_or(baseline_threads);
        info!(recommended_threads, "benchmark complete");
        Ok(BenchmarkReport {
            baseline_threads,
            samples,
            recommended_threads,
        })
    }
}

/// Highest efficiency among successful samples. Near-equal efficiencies
/// prefer the larger speedup.
pub fn recommend_by_efficiency(samples: &[BenchmarkSample]) -> Option<usize> {
    const EPSILON: f64 = 1e-9;
    samples
        .iter()
        .filter(|s| s.success)
        .max_by(|a, b| {
            if (a.efficiency - b.efficiency).abs() <= EPSILON {
                a.speedup.total_cmp(&b.speedup)
            } else {
                a.efficiency.total_cmp(&b.efficiency)
            }
        })
        .map(|s| s.threads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::StaticProbe;

    fn sample(threads: usize, speedup: f64, efficiency: f64, success: bool) -> BenchmarkSample {
        BenchmarkSample {
            threads,
            elapsed: Duration::from_millis(10),
            memory_delta_mb: 0.0,
            cpu_percent: 0.0,
            speedup,
            efficiency,
            success,
            error: None,
        }
    }

    #[test]
    fn recommends_efficiency_not_speedup() {
        let samples = vec![
            sample(1, 1.0, 1.0, true),
            sample(2, 1.9, 0.95, true),
            sample(8, 3.0, 0.375, true),
        ];
        assert_eq!(recommend_by_efficiency(&samples), Some(1));

        let superlinear = vec![
            sample(1, 1.0, 1.0, true),
            sample(2, 2.4, 1.2, true),
            sample(4, 4.0, 1.0, true),
        ];
        assert_eq!(recommend_by_efficiency(&superlinear), Some(2));
    }

    #[test]
    fn failed_samples_are_never_recommended() {
        let samples = vec![sample(1, 1.0, 1.0, true), sample(2, 4.0, 2.0, false)];
        assert_eq!(recommend_by_efficiency(&samples), Some(1));
    }

    #[test]
    fn runs_each_candidate_once_in_ascending_order() {
        let mut seen = Vec::new();
        let mut bench = PerformanceBenchmarker::new(StaticProbe::new(100.0, 20.0));
        let report = bench
            .run(&[4, 1, 2, 2, 0], |threads| {
                seen.push(threads);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![1, 2, 4]);
        assert_eq!(report.baseline_threads, 1);
        assert_eq!(report.samples.len(), 3);
        assert_eq!(report.samples[0].speedup, 1.0);
        assert_eq!(report.samples[0].efficiency, 1.0);
        assert!(report.samples.iter().all(|s| s.cpu_percent == 20.0));
        assert!([1, 2, 4].contains(&report.recommended_threads));
    }

    #[test]
    fn repetitions_run_workload_repeatedly() {
        let mut calls = 0;
        let mut bench = PerformanceBenchmarker::new(StaticProbe::default()).with_repetitions(3);
        bench
            .run(&[1, 2], |_| {
                calls += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(calls, 6);
    }

    #[test]
    fn failing_candidate_is_recorded() {
        let mut bench = PerformanceBenchmarker::new(StaticProbe::default());
        let report = bench
            .run(&[1, 2], |threads| {
                if threads == 2 {
                    Err(StagecoachError::ResourceCritical("out of memory".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap();
        assert!(!report.samples[1].success);
        assert!(report.samples[1].error.as_deref().unwrap().contains("out of memory"));
        assert_eq!(report.recommended_threads, 1);
    }

    #[test]
    fn failing_baseline_or_no_candidates_is_an_error() {
        let mut bench = PerformanceBenchmarker::new(StaticProbe::default());
        assert!(matches!(
            bench.run(&[], |_| Ok(())),
            Err(StagecoachError::Configuration(_))
        ));
        let result = bench.run(&[1, 2], |_| Err(StagecoachError::Metadata("boom".into())));
        assert!(matches!(result, Err(StagecoachError::UnitExecution { .. })));
    }
}
