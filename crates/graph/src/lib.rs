//! Dependency graph, metadata loading and staged execution planning.

pub mod analyzer;
pub mod graph;
pub mod metadata;
pub mod plan;
pub mod policy;

pub use analyzer::DependencyAnalyzer;
pub use graph::{DependencyGraph, GraphStats};
pub use metadata::{DependencyMetadata, ManifestSource, MetadataSource, StaticMetadata};
pub use plan::{
    ExecutionPhase, ExecutionPlan, ParallelizationOpportunity, ResourceEstimate, SafetyLevel,
    SafetyReport,
};
pub use policy::ConditionalPolicy;
