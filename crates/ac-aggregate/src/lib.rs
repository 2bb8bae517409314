//! Converts raw participant logs into per-condition accuracies.

pub mod aggregator;
pub mod diagnostics;

pub use aggregator::{
    AggregatedAccuracy, AggregationReport, ObservationAggregator, ParticipantAccuracies,
};
pub use diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSeverity};
