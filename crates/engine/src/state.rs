use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use stagecoach_core::{Result, StagecoachError};
use tracing::warn;

/// One adaptive sizing decision taken before a parallel phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingEvent {
    pub timestamp: DateTime<Utc>,
    pub stage: String,
    pub phase: usize,
    pub previous: usize,
    pub recommended: usize,
    /// Worker count actually used after clamping to engine bounds.
    pub applied: usize,
    pub critical: bool,
    pub reason: String,
}

/// Engine-wide mutable state, kept behind one mutex. Critical sections
/// are registry inserts/removes and history appends only.
#[derive(Debug)]
pub struct EngineState {
    active: BTreeSet<String>,
    scaling_history: Vec<ScalingEvent>,
    current_workers: usize,
}

impl EngineState {
    pub fn new(initial_workers: usize) -> Self {
        Self {
            active: BTreeSet::new(),
            scaling_history: Vec::new(),
            current_workers: initial_workers,
        }
    }

    /// Worker count applied to the most recent parallel phase.
    pub fn current_workers(&self) -> usize {
        self.current_workers
    }

    /// Executions registered and not yet finished.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn scaling_history(&self) -> &[ScalingEvent] {
        &self.scaling_history
    }

    /// Append a sizing decision and adopt its applied count.
    pub fn record_scaling(&mut self, event: ScalingEvent) {
        self.current_workers = event.applied;
        self.scaling_history.push(event);
    }

    fn insert(&mut self, execution_id: &str) -> Result<()> {
        if !self.active.insert(execution_id.to_string()) {
            return Err(StagecoachError::ConcurrencyFault {
                execution_id: execution_id.to_string(),
            });
        }
        Ok(())
    }
}

pub(crate) fn lock_state(state: &Mutex<EngineState>) -> MutexGuard<'_, EngineState> {
    state.lock().unwrap_or_else(|poisoned| {
        warn!("engine state lock poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Active-execution registration. Removed from the registry on drop.
#[derive(Debug)]
pub struct Registration<'a> {
    state: &'a Mutex<EngineState>,
    execution_id: String,
}

impl<'a> Registration<'a> {
    /// Register `execution_id`, failing with a concurrency fault if it is
    /// already active.
    pub fn acquire(state: &'a Mutex<EngineState>, execution_id: &str) -> Result<Self> {
        lock_state(state).insert(execution_id)?;
        Ok(Self {
            state,
            execution_id: execution_id.to_string(),
        })
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        lock_state(self.state).active.remove(&self.execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_a_concurrency_fault() {
        let state = Mutex::new(EngineState::new(4));
        let first = Registration::acquire(&state, "run:0:0:a").unwrap();
        let err = Registration::acquire(&state, "run:0:0:a").unwrap_err();
        assert!(matches!(err, StagecoachError::ConcurrencyFault { ref execution_id } if execution_id == "run:0:0:a"));
        assert!(err.is_structural());
        assert_eq!(lock_state(&state).active_count(), 1);

        drop(first);
        assert_eq!(lock_state(&state).active_count(), 0);
        let again = Registration::acquire(&state, "run:0:0:a").unwrap();
        assert_eq!(again.execution_id(), "run:0:0:a");
    }

    #[test]
    fn scaling_updates_current_workers() {
        let mut state = EngineState::new(4);
        state.record_scaling(ScalingEvent {
            timestamp: Utc::now(),
            stage: "s".into(),
            phase: 0,
            previous: 4,
            recommended: 1,
            applied: 2,
            critical: true,
            reason: "critical pressure".into(),
        });
        assert_eq!(state.current_workers(), 2);
        assert_eq!(state.scaling_history().len(), 1);
    }
}
