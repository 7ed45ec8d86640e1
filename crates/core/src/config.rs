use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::classifier::validate_table;
use crate::error::{Result, StagecoachError};
use crate::unit::UnitSpec;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

/// Parse a profiled env var, leaving `target` alone when unset or unparsable.
fn override_from_env<T: FromStr>(profile: &str, key: &str, target: &mut T) {
    if let Some(raw) = profiled_env_opt(profile, key) {
        match raw.parse() {
            Ok(v) => *target = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable env override"),
        }
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    #[serde(skip)]
    pub profile: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub adjuster: AdjusterConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Static classification table keyed by unit name.
    #[serde(default)]
    pub units: BTreeMap<String, UnitSpec>,
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a TOML file (or defaults when `path` is `None`), apply env
    /// overrides for the profile in `STAGECOACH_PROFILE`, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                tracing::debug!(path = %p.display(), "Loading config");
                let content = std::fs::read_to_string(p).map_err(|e| {
                    StagecoachError::Configuration(format!("failed to read {}: {e}", p.display()))
                })?;
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };
        let profile = env_or("STAGECOACH_PROFILE", "").to_uppercase();
        config.apply_env_overrides(&profile);
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment variables. Every key is first looked up as
    /// `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn apply_env_overrides(&mut self, profile: &str) {
        let p = profile.to_uppercase();
        let p = p.as_str();
        self.profile = p.to_string();
        override_from_env(p, "STAGECOACH_MAX_WORKERS", &mut self.engine.max_workers);
        override_from_env(p, "STAGECOACH_MIN_WORKERS", &mut self.engine.min_workers);
        override_from_env(p, "STAGECOACH_MAX_BATCH_SIZE", &mut self.engine.max_batch_size);
        override_from_env(p, "STAGECOACH_DETERMINISTIC", &mut self.engine.deterministic);
        override_from_env(p, "STAGECOACH_BASE_SEED", &mut self.engine.base_seed);
        override_from_env(p, "STAGECOACH_ADAPTIVE_SCALING", &mut self.engine.adaptive_scaling);
        override_from_env(p, "STAGECOACH_MEMORY_CRITICAL_MB", &mut self.resources.memory_critical_mb);
        override_from_env(p, "STAGECOACH_CPU_CRITICAL_PERCENT", &mut self.resources.cpu_critical_percent);
        if let Some(path) = profiled_env_opt(p, "STAGECOACH_MANIFEST_PATH") {
            self.metadata.manifest_path = PathBuf::from(path);
        }
    }

    /// Startup validation. Any error here is fatal.
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.resources.validate()?;
        self.adjuster.validate()?;
        validate_table(&self.units)
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  engine:     workers={}..={}, batch={}, deterministic={}, seed={}",
            self.engine.min_workers,
            self.engine.max_workers,
            self.engine.max_batch_size,
            self.engine.deterministic,
            self.engine.base_seed
        );
        tracing::info!(
            "  memory:     moderate={}MB, high={}MB, critical={}MB, gc={}MB",
            self.resources.memory_moderate_mb,
            self.resources.memory_high_mb,
            self.resources.memory_critical_mb,
            self.resources.gc_trigger_mb
        );
        tracing::info!(
            "  cpu:        moderate={}%, high={}%, critical={}%",
            self.resources.cpu_moderate_percent,
            self.resources.cpu_high_percent,
            self.resources.cpu_critical_percent
        );
        tracing::info!(
            "  adjuster:   threads={}..={}, cooldown={}s",
            self.adjuster.min_threads,
            self.adjuster.max_threads,
            self.adjuster.cooldown_secs
        );
        tracing::info!("  metadata:   manifest={}", self.metadata.manifest_path.display());
        tracing::info!("  units:      {} classified", self.units.len());
    }
}

fn ascending(name: &str, moderate: f64, high: f64, critical: f64) -> Result<()> {
    if moderate < high && high < critical {
        Ok(())
    } else {
        Err(StagecoachError::Configuration(format!(
            "{name} thresholds must be ascending (moderate < high < critical), got {moderate}/{high}/{critical}"
        )))
    }
}

// ── Engine ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on workers in one parallel phase.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// Largest batch the planner proposes. Independent of `max_workers` so
    /// that plans, and therefore seeds, do not change with the worker count.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_true")]
    pub deterministic: bool,
    #[serde(default = "default_base_seed")]
    pub base_seed: u64,
    /// Let the thread adjuster override the worker count between phases.
    #[serde(default = "default_true")]
    pub adaptive_scaling: bool,
}

fn default_max_workers() -> usize { 4 }
fn default_min_workers() -> usize { 1 }
fn default_max_batch_size() -> usize { 32 }
fn default_base_seed() -> u64 { 42 }
fn default_true() -> bool { true }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            min_workers: default_min_workers(),
            max_batch_size: default_max_batch_size(),
            deterministic: true,
            base_seed: default_base_seed(),
            adaptive_scaling: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_workers == 0 {
            return Err(StagecoachError::Configuration("engine.min_workers must be at least 1".into()));
        }
        if self.max_workers < self.min_workers {
            return Err(StagecoachError::Configuration(format!(
                "engine.max_workers ({}) is below engine.min_workers ({})",
                self.max_workers, self.min_workers
            )));
        }
        if self.max_batch_size == 0 {
            return Err(StagecoachError::Configuration("engine.max_batch_size must be at least 1".into()));
        }
        Ok(())
    }
}

// ── Resources ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_memory_moderate")]
    pub memory_moderate_mb: f64,
    #[serde(default = "default_memory_high")]
    pub memory_high_mb: f64,
    #[serde(default = "default_memory_critical")]
    pub memory_critical_mb: f64,
    /// Usage at which the memory monitor proactively runs reclaimers.
    #[serde(default = "default_gc_trigger")]
    pub gc_trigger_mb: f64,
    /// Sustained growth rate that, together with a peak above the high
    /// threshold, is reported as a leak.
    #[serde(default = "default_leak_rate")]
    pub leak_growth_mb_per_min: f64,
    /// Number of trailing samples the growth trend is computed over.
    #[serde(default = "default_leak_window")]
    pub leak_window: usize,
    #[serde(default = "default_cpu_moderate")]
    pub cpu_moderate_percent: f64,
    #[serde(default = "default_cpu_high")]
    pub cpu_high_percent: f64,
    #[serde(default = "default_cpu_critical")]
    pub cpu_critical_percent: f64,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// A cleanup that frees less than this is reported as ineffective.
    #[serde(default = "default_cleanup_effective")]
    pub cleanup_effective_mb: f64,
}

fn default_memory_moderate() -> f64 { 2048.0 }
fn default_memory_high() -> f64 { 3072.0 }
fn default_memory_critical() -> f64 { 3584.0 }
fn default_gc_trigger() -> f64 { 2560.0 }
fn default_leak_rate() -> f64 { 64.0 }
fn default_leak_window() -> usize { 10 }
fn default_cpu_moderate() -> f64 { 70.0 }
fn default_cpu_high() -> f64 { 85.0 }
fn default_cpu_critical() -> f64 { 95.0 }
fn default_sample_interval() -> u64 { 1000 }
fn default_history_size() -> usize { 120 }
fn default_cleanup_effective() -> f64 { 1.0 }

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_moderate_mb: default_memory_moderate(),
            memory_high_mb: default_memory_high(),
            memory_critical_mb: default_memory_critical(),
            gc_trigger_mb: default_gc_trigger(),
            leak_growth_mb_per_min: default_leak_rate(),
            leak_window: default_leak_window(),
            cpu_moderate_percent: default_cpu_moderate(),
            cpu_high_percent: default_cpu_high(),
            cpu_critical_percent: default_cpu_critical(),
            sample_interval_ms: default_sample_interval(),
            history_size: default_history_size(),
            cleanup_effective_mb: default_cleanup_effective(),
        }
    }
}

impl ResourceConfig {
    pub fn validate(&self) -> Result<()> {
        ascending("memory", self.memory_moderate_mb, self.memory_high_mb, self.memory_critical_mb)?;
        ascending("cpu", self.cpu_moderate_percent, self.cpu_high_percent, self.cpu_critical_percent)?;
        if self.gc_trigger_mb < self.memory_moderate_mb || self.gc_trigger_mb > self.memory_critical_mb {
            return Err(StagecoachError::Configuration(format!(
                "resources.gc_trigger_mb ({}) must lie between the moderate and critical thresholds",
                self.gc_trigger_mb
            )));
        }
        if self.sample_interval_ms == 0 {
            return Err(StagecoachError::Configuration(
                "resources.sample_interval_ms must be positive".into(),
            ));
        }
        if self.history_size == 0 || self.leak_window < 2 {
            return Err(StagecoachError::Configuration(
                "resources.history_size must be positive and resources.leak_window at least 2".into(),
            ));
        }
        Ok(())
    }
}

// ── Adaptive thread adjuster ──────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjusterConfig {
    #[serde(default = "default_min_threads")]
    pub min_threads: usize,
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Minimum time between two non-critical adjustments.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Executions remembered per thread count.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Executions needed before a thread count's average is trusted.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

fn default_min_threads() -> usize { 1 }
fn default_max_threads() -> usize { 8 }
fn default_cooldown() -> u64 { 30 }
fn default_history_window() -> usize { 10 }
fn default_min_samples() -> usize { 3 }

impl Default for AdjusterConfig {
    fn default() -> Self {
        Self {
            min_threads: default_min_threads(),
            max_threads: default_max_threads(),
            cooldown_secs: default_cooldown(),
            history_window: default_history_window(),
            min_samples: default_min_samples(),
        }
    }
}

impl AdjusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_threads == 0 || self.max_threads < self.min_threads {
            return Err(StagecoachError::Configuration(format!(
                "adjuster thread bounds are invalid: {}..={}",
                self.min_threads, self.max_threads
            )));
        }
        if self.history_window == 0 {
            return Err(StagecoachError::Configuration("adjuster.history_window must be positive".into()));
        }
        Ok(())
    }
}

// ── Analyzer ──────────────────────────────────────────────────

/// Name/dependency substring lists used to decide whether a conditional
/// unit may be proposed for parallel execution. Heuristic only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalPolicyConfig {
    #[serde(default = "default_allow_names")]
    pub allow_name_patterns: Vec<String>,
    #[serde(default = "default_deny_names")]
    pub deny_name_patterns: Vec<String>,
    #[serde(default = "default_deny_dependencies")]
    pub deny_dependency_patterns: Vec<String>,
}

fn default_allow_names() -> Vec<String> {
    ["stg_", "dim_", "int_baseline", "int_hazard"].iter().map(|s| s.to_string()).collect()
}

fn default_deny_names() -> Vec<String> {
    ["accumulator", "snapshot", "fct_", "events", "state"].iter().map(|s| s.to_string()).collect()
}

fn default_deny_dependencies() -> Vec<String> {
    ["accumulator", "snapshot", "fct_"].iter().map(|s| s.to_string()).collect()
}

impl Default for ConditionalPolicyConfig {
    fn default() -> Self {
        Self {
            allow_name_patterns: default_allow_names(),
            deny_name_patterns: default_deny_names(),
            deny_dependency_patterns: default_deny_dependencies(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default)]
    pub conditional: ConditionalPolicyConfig,
    /// More memory-intensive units than this in one batch produces a warning.
    #[serde(default = "default_memory_intensive_limit")]
    pub memory_intensive_limit: usize,
}

fn default_memory_intensive_limit() -> usize { 2 }

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            conditional: ConditionalPolicyConfig::default(),
            memory_intensive_limit: default_memory_intensive_limit(),
        }
    }
}

// ── Dependency metadata ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,
    /// argv run once when the manifest is missing, e.g. `["dbt", "compile"]`.
    #[serde(default)]
    pub compile_command: Vec<String>,
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from("target/manifest.json")
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            manifest_path: default_manifest_path(),
            compile_command: Vec::new(),
        }
    }
}
