use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Variable bag handed to the executor. Ordered so that serialization is stable.
pub type Variables = BTreeMap<String, serde_json::Value>;

/// What the external tool reported for one unit invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub elapsed: Duration,
}

impl UnitOutcome {
    pub fn succeeded(elapsed: Duration) -> Self {
        Self {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
            return_code: 0,
            elapsed,
        }
    }

    pub fn failed(return_code: i32, stderr: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
            return_code,
            elapsed,
        }
    }
}

/// Runs a single unit. Implementations own their retry and backoff policy.
///
/// The engine calls this from several worker threads at once, but every call
/// receives its own variable map, so implementations only need `Sync` for
/// whatever shared configuration they hold.
pub trait Executor: Send + Sync {
    /// `Err` means the invocation itself could not be carried out; a tool
    /// that ran and reported failure returns `Ok` with `success == false`.
    fn execute(&self, selector: &str, variables: &Variables, seed: Option<u64>) -> Result<UnitOutcome>;
}
