use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stagecoach_core::Config;
use tracing::debug;

/// How the `run` command invokes the transformation tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// argv template. `{selector}` is the unit name, `{vars}` the variables
    /// as JSON and `{seed}` the derived seed (empty when there is none).
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_command() -> Vec<String> {
    ["dbt", "run", "--select", "{selector}", "--vars", "{vars}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            working_dir: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ExecutorSection {
    #[serde(default)]
    executor: ExecutorConfig,
}

/// Scheduler config plus the CLI-only `[executor]` section.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub core: Config,
    pub executor: ExecutorConfig,
}

impl CliConfig {
    /// Load from `path` (defaults when `None`), apply env overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let core = Config::load(path).context("invalid scheduler configuration")?;
        let executor = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config: {}", p.display()))?;
                Self::executor_section(&content)
                    .with_context(|| format!("failed to parse [executor] in {}", p.display()))?
            }
            None => {
                debug!("No config file, using default executor command");
                ExecutorConfig::default()
            }
        };
        Ok(Self { core, executor })
    }

    fn executor_section(content: &str) -> Result<ExecutorConfig> {
        let section: ExecutorSection = toml::from_str(content)?;
        Ok(section.executor)
    }
}
