//! Read-only snapshots of each unit's declared upstream units.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;
use stagecoach_core::config::MetadataConfig;
use stagecoach_core::{Result, StagecoachError};
use tracing::{debug, info, warn};

/// `unit -> upstream units`, as declared by the transformation project.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyMetadata {
    pub upstream: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyMetadata {
    pub fn len(&self) -> usize {
        self.upstream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty()
    }
}

/// Somewhere dependency metadata can be (re)loaded from. Loading may block.
pub trait MetadataSource: Send + Sync {
    fn load(&self) -> Result<DependencyMetadata>;
}

/// In-memory metadata, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    metadata: DependencyMetadata,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dependency(mut self, unit: &str, dep: &str) -> Self {
        self.metadata
            .upstream
            .entry(unit.to_string())
            .or_default()
            .insert(dep.to_string());
        self
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.metadata.upstream.entry(unit.to_string()).or_default();
        self
    }
}

impl MetadataSource for StaticMetadata {
    fn load(&self) -> Result<DependencyMetadata> {
        Ok(self.metadata.clone())
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    nodes: HashMap<String, ManifestNode>,
}

#[derive(Debug, Deserialize)]
struct ManifestNode {
    name: String,
    #[serde(default)]
    resource_type: String,
    #[serde(default)]
    depends_on: ManifestDependsOn,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestDependsOn {
    #[serde(default)]
    nodes: Vec<String>,
}

/// Compiled-project manifest on disk. When the file is missing and a compile
/// command is configured, the command is run once to produce it.
#[derive(Debug, Clone)]
pub struct ManifestSource {
    path: PathBuf,
    compile_command: Vec<String>,
}

impl ManifestSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            compile_command: Vec::new(),
        }
    }

    pub fn from_config(config: &MetadataConfig) -> Self {
        Self {
            path: config.manifest_path.clone(),
            compile_command: config.compile_command.clone(),
        }
    }

    pub fn with_compile_command(mut self, argv: Vec<String>) -> Self {
        self.compile_command = argv;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compile(&self) -> Result<()> {
        let Some((program, args)) = self.compile_command.split_first() else {
            return Err(StagecoachError::Metadata(format!(
                "manifest {} not found and no compile command configured",
                self.path.display()
            )));
        };
        info!(command = %self.compile_command.join(" "), "Manifest missing, compiling project");
        let status = Command::new(program).args(args).status()?;
        if !status.success() {
            return Err(StagecoachError::Metadata(format!(
                "compile command exited with {status}"
            )));
        }
        Ok(())
    }
}

impl MetadataSource for ManifestSource {
    fn load(&self) -> Result<DependencyMetadata> {
        if !self.path.exists() {
            self.compile()?;
            if !self.path.exists() {
                return Err(StagecoachError::Metadata(format!(
                    "compile command did not produce {}",
                    self.path.display()
                )));
            }
        }
        debug!(path = %self.path.display(), "Loading dependency manifest");
        let content = std::fs::read_to_string(&self.path)?;
        parse_manifest(&content)
    }
}

/// Extract model-to-model dependencies; sources, seeds and tests are not units.
pub fn parse_manifest(content: &str) -> Result<DependencyMetadata> {
    let manifest: Manifest = serde_json::from_str(content)?;

    let models: HashMap<&str, &ManifestNode> = manifest
        .nodes
        .iter()
        .filter(|(_, node)| node.resource_type == "model")
        .map(|(id, node)| (id.as_str(), node))
        .collect();

    let mut metadata = DependencyMetadata::default();
    for node in models.values() {
        let deps = metadata.upstream.entry(node.name.clone()).or_default();
        for upstream_id in &node.depends_on.nodes {
            match models.get(upstream_id.as_str()) {
                Some(upstream) if upstream.name != node.name => {
                    deps.insert(upstream.name.clone());
                }
                Some(_) => warn!(unit = %node.name, "ignoring self-dependency in manifest"),
                None => {}
            }
        }
    }
    info!(units = metadata.len(), "Dependency metadata loaded");
    Ok(metadata)
}
