//! Recoverable aggregation findings.

use ac_types::ParticipantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DiagnosticSeverity {
    /// Advisory; every accuracy was still computed from matched trials.
    Info,
    /// An accuracy was recorded without supporting data.
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiagnosticKind {
    /// No relevant trial matched the condition; its accuracy was recorded as 0.
    NoMatchingTrials {
        participant: ParticipantId,
        condition: f64,
    },
    /// Two conditions are close enough that their tolerance bands overlap,
    /// so a trial may be counted towards both.
    AmbiguousMatch {
        first: f64,
        second: f64,
        /// Scaled distance between the two conditions.
        spacing: f64,
        tolerance: f64,
    },
}

/// One diagnostic entry, kept in cycle state and forwarded to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub severity: DiagnosticSeverity,
    pub kind: DiagnosticKind,
    pub message: String,
    /// Filled in by the controller once the cycle is known.
    pub cycle: Option<usize>,
}

impl Diagnostic {
    pub fn new(severity: DiagnosticSeverity, kind: DiagnosticKind, message: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            severity,
            kind,
            message,
            cycle: None,
        }
    }

    pub fn in_cycle(mut self, cycle: usize) -> Self {
        self.cycle = Some(cycle);
        self
    }

    pub(crate) fn no_matching_trials(participant: ParticipantId, condition: f64) -> Self {
        Self::new(
            DiagnosticSeverity::Warning,
            DiagnosticKind::NoMatchingTrials {
                participant,
                condition,
            },
            format!("no trials of {participant} matched condition {condition:.4}; accuracy set to 0"),
        )
    }

    pub(crate) fn ambiguous_match(first: f64, second: f64, spacing: f64, tolerance: f64) -> Self {
        Self::new(
            DiagnosticSeverity::Info,
            DiagnosticKind::AmbiguousMatch {
                first,
                second,
                spacing,
                tolerance,
            },
            format!(
                "conditions {first:.4} and {second:.4} are {spacing:.3} apart on the field scale, \
                 within twice the tolerance {tolerance}"
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_follows_kind() {
        assert!(DiagnosticSeverity::Info < DiagnosticSeverity::Warning);
        assert_eq!(
            Diagnostic::no_matching_trials(ParticipantId(0), 0.5).severity,
            DiagnosticSeverity::Warning
        );
        assert_eq!(
            Diagnostic::ambiguous_match(0.4, 0.401, 0.1, 0.1).severity,
            DiagnosticSeverity::Info
        );
    }

    #[test]
    fn diagnostic_serialization_roundtrip() {
        let diag = Diagnostic::no_matching_trials(ParticipantId(3), 0.25).in_cycle(2);
        let json = serde_json::to_string(&diag).unwrap();
        let back: Diagnostic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, diag);
        assert_eq!(back.cycle, Some(2));
        assert!(back.message.contains("p3"));
    }
}
