//! Controller-owned accumulated state and the phase machine.

use ac_aggregate::Diagnostic;
use ac_types::Condition;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-cycle phases, entered in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CyclePhase {
    Sampling,
    Synthesizing,
    Dispatching,
    Polling,
    Aggregating,
    Fitting,
    Done,
}

impl CyclePhase {
    /// The phase after `self` within a cycle; `Fitting` loops back to
    /// `Sampling` unless the run is complete.
    pub fn next(self, run_complete: bool) -> CyclePhase {
        match self {
            CyclePhase::Sampling => CyclePhase::Synthesizing,
            CyclePhase::Synthesizing => CyclePhase::Dispatching,
            CyclePhase::Dispatching => CyclePhase::Polling,
            CyclePhase::Polling => CyclePhase::Aggregating,
            CyclePhase::Aggregating => CyclePhase::Fitting,
            CyclePhase::Fitting if run_complete => CyclePhase::Done,
            CyclePhase::Fitting => CyclePhase::Sampling,
            CyclePhase::Done => CyclePhase::Done,
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CyclePhase::Sampling => "sampling",
            CyclePhase::Synthesizing => "synthesizing",
            CyclePhase::Dispatching => "dispatching",
            CyclePhase::Polling => "polling",
            CyclePhase::Aggregating => "aggregating",
            CyclePhase::Fitting => "fitting",
            CyclePhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Everything accumulated over completed cycles. Only grows.
///
/// `conditions[i]` and `accuracies[i]` describe the same observation;
/// `predictions` is the latest model evaluated at every accumulated condition.
#[derive(Debug, Clone)]
pub struct CycleState<M> {
    pub conditions: Vec<Condition>,
    pub accuracies: Vec<f64>,
    pub model: Option<M>,
    pub predictions: Vec<f64>,
    pub diagnostics: Vec<Diagnostic>,
    /// One report per fitted model, oldest first.
    pub model_reports: Vec<String>,
    pub cycles_completed: usize,
}

impl<M> CycleState<M> {
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
            accuracies: Vec::new(),
            model: None,
            predictions: Vec::new(),
            diagnostics: Vec::new(),
            model_reports: Vec::new(),
            cycles_completed: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Model inputs: one single-column row per accumulated condition.
    pub fn design_matrix(&self) -> Vec<Vec<f64>> {
        self.conditions.iter().map(|c| vec![c.value()]).collect()
    }

    pub fn condition_values(&self) -> Vec<f64> {
        self.conditions.iter().map(|c| c.value()).collect()
    }
}

impl<M> Default for CycleState<M> {
    fn default() -> Self {
        Self::new()
    }
}
