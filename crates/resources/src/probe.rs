use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use sysinfo::{Pid, System, MINIMUM_CPU_UPDATE_INTERVAL};

use crate::lock;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Source of raw memory and CPU readings.
pub trait SystemProbe: Send {
    /// Resident memory of this process, in MB.
    fn process_memory_mb(&mut self) -> f64;

    /// Share of total system memory in use, 0-100.
    fn system_memory_percent(&mut self) -> f64;

    /// Global CPU utilisation, 0-100.
    fn cpu_percent(&mut self) -> f64;
}

/// Live readings from the operating system.
///
/// CPU usage is a delta between two refreshes, so a reading taken sooner
/// than `MINIMUM_CPU_UPDATE_INTERVAL` after the previous refresh waits out
/// the remainder first.
pub struct SysinfoProbe {
    system: System,
    pid: Option<Pid>,
    last_cpu_refresh: Instant,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = e, "cannot resolve current pid, falling back to system memory");
                None
            }
        };
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system,
            pid,
            last_cpu_refresh: Instant::now(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn process_memory_mb(&mut self) -> f64 {
        if let Some(pid) = self.pid {
            if self.system.refresh_process(pid) {
                if let Some(process) = self.system.process(pid) {
                    return process.memory() as f64 / BYTES_PER_MB;
                }
            }
        }
        self.system.refresh_memory();
        self.system.used_memory() as f64 / BYTES_PER_MB
    }

    fn system_memory_percent(&mut self) -> f64 {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return 0.0;
        }
        self.system.used_memory() as f64 / total as f64 * 100.0
    }

    fn cpu_percent(&mut self) -> f64 {
        let since = self.last_cpu_refresh.elapsed();
        if since < MINIMUM_CPU_UPDATE_INTERVAL {
            thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL - since);
        }
        self.system.refresh_cpu();
        self.last_cpu_refresh = Instant::now();
        f64::from(self.system.global_cpu_info().cpu_usage())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Readings {
    memory_mb: f64,
    memory_percent: f64,
    cpu_percent: f64,
}

/// Fixed readings that can be changed from another handle.
///
/// Clones share the same readings, so a test can keep one handle and hand
/// the other to a monitor.
#[derive(Debug, Default, Clone)]
pub struct StaticProbe {
    readings: Arc<Mutex<Readings>>,
}

impl StaticProbe {
    pub fn new(memory_mb: f64, cpu_percent: f64) -> Self {
        let probe = Self::default();
        probe.set_memory_mb(memory_mb);
        probe.set_cpu_percent(cpu_percent);
        probe
    }

    pub fn set_memory_mb(&self, memory_mb: f64) {
        lock(&self.readings).memory_mb = memory_mb;
    }

    pub fn set_memory_percent(&self, percent: f64) {
        lock(&self.readings).memory_percent = percent;
    }

    pub fn set_cpu_percent(&self, percent: f64) {
        lock(&self.readings).cpu_percent = percent;
    }
}

impl SystemProbe for StaticProbe {
    fn process_memory_mb(&mut self) -> f64 {
        lock(&self.readings).memory_mb
    }

    fn system_memory_percent(&mut self) -> f64 {
        lock(&self.readings).memory_percent
    }

    fn cpu_percent(&mut self) -> f64 {
        lock(&self.readings).cpu_percent
    }
}
