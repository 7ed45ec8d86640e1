use std::fmt;

use thiserror::Error;

/// A subset of units that could not be ordered because of a dependency cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    /// Units left with a non-zero in-degree once Kahn's algorithm stalled, sorted.
    pub units: Vec<String>,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dependency cycle among units: {}", self.units.join(", "))
    }
}

impl std::error::Error for CycleError {}

#[derive(Error, Debug)]
pub enum StagecoachError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Dependency cycle among units: {}", units.join(", "))]
    Cycle { units: Vec<String> },

    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    #[error("Critical resource pressure: {0}")]
    ResourceCritical(String),

    #[error("Unit {unit} failed: {message}")]
    UnitExecution { unit: String, message: String },

    #[error("Concurrency fault: execution {execution_id} is already active")]
    ConcurrencyFault { execution_id: String },

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(String),
}

impl StagecoachError {
    /// Structural errors abort a stage immediately; everything else degrades
    /// to a slower path or stays local to one phase.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            StagecoachError::Configuration(_)
                | StagecoachError::Cycle { .. }
                | StagecoachError::ConcurrencyFault { .. }
                | StagecoachError::Metadata(_)
        )
    }
}

impl From<CycleError> for StagecoachError {
    fn from(err: CycleError) -> Self {
        StagecoachError::Cycle { units: err.units }
    }
}

impl From<serde_json::Error> for StagecoachError {
    fn from(err: serde_json::Error) -> Self {
        StagecoachError::Serialize(err.to_string())
    }
}

impl From<toml::de::Error> for StagecoachError {
    fn from(err: toml::de::Error) -> Self {
        StagecoachError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StagecoachError>;
