//! Live run control state.
//!
//! An injectable table rather than ambient global state: the control
//! surface and the orchestrator share one `Arc<RunRegistry>`. Entries exist
//! exactly while a run's loop is alive; control operations never create
//! them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::conversion::ConversionMatrix;

/// Mutable control record for one live run. `paused`, `stopped` and `speed`
/// are written externally and read by the orchestrator at iteration
/// boundaries; only the orchestrator consumes `matrix`.
#[derive(Debug, Clone)]
pub struct RunControl {
    pub paused: bool,
    pub stopped: bool,
    pub speed: u32,
    pub matrix: Arc<ConversionMatrix>,
}

/// Control-surface failures, reported as values rather than panics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// No live registry entry for the run id.
    RunNotActive,
    /// No such run exists at all (persisted or live).
    RunNotFound,
    /// The persistence layer failed while servicing the operation.
    Storage(String),
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::RunNotActive => write!(f, "run not active"),
            ControlError::RunNotFound => write!(f, "run not found"),
            ControlError::Storage(msg) => write!(f, "storage failure: {}", msg),
        }
    }
}

impl std::error::Error for ControlError {}

#[derive(Default)]
pub struct RunRegistry {
    inner: Mutex<HashMap<i64, RunControl>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the control record at stream start. Run ids come from the
    /// store's rowid allocation, so an id is never reused while live.
    pub fn register(&self, run_id: i64, speed: u32, matrix: Arc<ConversionMatrix>) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.insert(run_id, RunControl { paused: false, stopped: false, speed: speed.max(1), matrix });
    }

    /// Unconditional removal at loop exit; removing an absent entry is fine.
    pub fn remove(&self, run_id: i64) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.remove(&run_id);
    }

    pub fn is_live(&self, run_id: i64) -> bool {
        self.inner.lock().expect("registry lock poisoned").contains_key(&run_id)
    }

    /// Snapshot of the control flags for one iteration boundary.
    pub fn control(&self, run_id: i64) -> Option<RunControl> {
        self.inner.lock().expect("registry lock poisoned").get(&run_id).cloned()
    }

    pub fn pause(&self, run_id: i64) -> Result<(), ControlError> {
        self.mutate(run_id, |c| c.paused = true)
    }

    pub fn resume(&self, run_id: i64) -> Result<(), ControlError> {
        self.mutate(run_id, |c| c.paused = false)
    }

    pub fn stop(&self, run_id: i64) -> Result<(), ControlError> {
        self.mutate(run_id, |c| c.stopped = true)
    }

    /// Speed is clamped to >= 1 here, at the boundary: the orchestrator
    /// never observes a non-positive value from the registry.
    pub fn set_speed(&self, run_id: i64, speed: i64) -> Result<u32, ControlError> {
        let clamped = speed.max(1) as u32;
        self.mutate(run_id, |c| c.speed = clamped)?;
        Ok(clamped)
    }

    fn mutate(&self, run_id: i64, f: impl FnOnce(&mut RunControl)) -> Result<(), ControlError> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        match inner.get_mut(&run_id) {
            Some(control) => {
                f(control);
                Ok(())
            }
            None => Err(ControlError::RunNotActive),
        }
    }
}
