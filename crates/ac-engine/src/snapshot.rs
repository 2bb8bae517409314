//! Read-only snapshots for the display side.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::state::{CyclePhase, CycleState};

/// Immutable copy of the observable state at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSnapshot {
    pub conditions: Vec<f64>,
    pub accuracies: Vec<f64>,
    pub predictions: Vec<f64>,
    pub phase: CyclePhase,
    pub status: String,
}

impl CycleSnapshot {
    pub fn initial() -> Self {
        Self {
            conditions: Vec::new(),
            accuracies: Vec::new(),
            predictions: Vec::new(),
            phase: CyclePhase::Sampling,
            status: "waiting to start".to_string(),
        }
    }

    pub fn capture<M>(state: &CycleState<M>, phase: CyclePhase, status: String) -> Self {
        Self {
            conditions: state.condition_values(),
            accuracies: state.accuracies.clone(),
            predictions: state.predictions.clone(),
            phase,
            status,
        }
    }
}

/// Writer side. Each publish replaces the whole snapshot in one swap.
#[derive(Debug)]
pub struct SnapshotPublisher {
    current: Arc<RwLock<Arc<CycleSnapshot>>>,
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(CycleSnapshot::initial()))),
        }
    }

    pub fn publish(&self, snapshot: CycleSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }

    pub fn handle(&self) -> SnapshotHandle {
        SnapshotHandle {
            current: Arc::clone(&self.current),
        }
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader side, cheap to clone and safe to use from any task.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    current: Arc<RwLock<Arc<CycleSnapshot>>>,
}

impl SnapshotHandle {
    pub fn latest(&self) -> Arc<CycleSnapshot> {
        Arc::clone(&*self.current.read())
    }
}
