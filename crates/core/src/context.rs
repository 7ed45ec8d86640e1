use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::executor::Variables;

/// Seeds are truncated to 31 bits so every consumer can treat them as a
/// non-negative signed 32-bit value.
pub const SEED_MASK: u64 = 0x7FFF_FFFF;

/// Per-stage execution context. Never mutated once built; units get clones
/// with a derived id and seed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionContext {
    pub simulation_year: i32,
    pub variables: Variables,
    pub stage: String,
    pub execution_id: String,
    pub started_at: DateTime<Utc>,
    pub seed: Option<u64>,
}

impl ExecutionContext {
    pub fn new(stage: &str, simulation_year: i32, variables: Variables) -> Self {
        Self {
            simulation_year,
            variables,
            stage: stage.to_string(),
            execution_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            seed: None,
        }
    }

    pub fn with_execution_id(mut self, execution_id: &str) -> Self {
        self.execution_id = execution_id.to_string();
        self
    }

    /// Clone the context for one dispatched unit. The derived id is unique per
    /// (phase, ordinal, unit) within this stage execution.
    pub fn for_unit(&self, phase: usize, ordinal: usize, unit: &str, base_seed: u64) -> Self {
        let mut ctx = self.clone();
        ctx.execution_id = format!("{}:{}:{}:{}", self.execution_id, phase, ordinal, unit);
        ctx.seed = Some(derive_seed(ordinal, unit, self.simulation_year, base_seed));
        ctx
    }

    /// Variables as handed to the executor: the stage variables plus the
    /// simulation year, unless the caller set one explicitly.
    pub fn executor_variables(&self) -> Variables {
        let mut vars = self.variables.clone();
        vars.entry("simulation_year".to_string())
            .or_insert_with(|| serde_json::Value::from(self.simulation_year));
        vars
    }
}

/// Derive a unit seed from its ordinal position in the batch, its name, the
/// simulation year and the base seed. Independent of thread count and of
/// completion order.
pub fn derive_seed(ordinal: usize, unit: &str, simulation_year: i32, base_seed: u64) -> u64 {
    let key = format!("{ordinal}:{unit}:{simulation_year}:{base_seed}");
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) & SEED_MASK
}
