use ac_types::{
    invalid_parameter, AcResult, AggregationFields, Condition, CycleConfig, Observation,
    ParticipantId,
};
use crossbeam_channel::Sender;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::diagnostics::{Diagnostic, DiagnosticSeverity};

/// Slack on the tolerance band so boundary values survive float rounding.
const MATCH_EPSILON: f64 = 1e-9;

/// Accuracy of one participant at one condition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatedAccuracy {
    pub condition: Condition,
    /// `correct / matched`, or 0 when nothing matched.
    pub accuracy: f64,
    pub matched: usize,
    pub correct: usize,
}

/// One accuracy per condition, in condition order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantAccuracies {
    pub participant: ParticipantId,
    pub accuracies: Vec<AggregatedAccuracy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationReport {
    /// Ascending participant id.
    pub participants: Vec<ParticipantAccuracies>,
    pub diagnostics: Vec<Diagnostic>,
}

impl AggregationReport {
    /// Every accuracy, participant-major, ready to append to cycle state.
    pub fn accuracies(&self) -> impl Iterator<Item = &AggregatedAccuracy> {
        self.participants.iter().flat_map(|p| p.accuracies.iter())
    }
}

/// Scores observations against a condition batch.
///
/// A trial counts towards a condition when its category field equals the
/// configured trial type and its numeric field lies within `tolerance` of the
/// condition multiplied by `value_scale`. Diagnostics are logged and, when a
/// sink is attached, forwarded on the channel.
#[derive(Debug, Clone)]
pub struct ObservationAggregator {
    fields: AggregationFields,
    tolerance: f64,
    diagnostics_tx: Option<Sender<Diagnostic>>,
}

impl ObservationAggregator {
    pub fn new(fields: AggregationFields, tolerance: f64) -> AcResult<Self> {
        fields.validate()?;
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(invalid_parameter!(
                "match tolerance must be a non-negative number, got {tolerance}"
            ));
        }
        Ok(Self {
            fields,
            tolerance,
            diagnostics_tx: None,
        })
    }

    pub fn from_config(config: &CycleConfig) -> AcResult<Self> {
        Self::new(config.aggregation.clone(), config.match_tolerance)
    }

    pub fn with_diagnostics(mut self, tx: Sender<Diagnostic>) -> Self {
        self.diagnostics_tx = Some(tx);
        self
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Score a single observation at a single condition.
    pub fn score(&self, observation: &Observation, condition: Condition) -> AggregatedAccuracy {
        let target = condition.scaled(self.fields.value_scale);
        let mut matched = 0;
        let mut correct = 0;
        for record in observation.trials() {
            if !self.is_relevant(record) {
                continue;
            }
            let Some(value) = record.get(&self.fields.value_field).and_then(Value::as_f64) else {
                continue;
            };
            if (value - target).abs() > self.tolerance + MATCH_EPSILON {
                continue;
            }
            matched += 1;
            if is_correct(record.get(&self.fields.correct_field)) {
                correct += 1;
            }
        }
        let accuracy = if matched == 0 {
            0.0
        } else {
            correct as f64 / matched as f64
        };
        AggregatedAccuracy {
            condition,
            accuracy,
            matched,
            correct,
        }
    }

    /// Per-participant accuracies for every condition, ascending participant id.
    pub fn aggregate(
        &self,
        observations: &BTreeMap<ParticipantId, Observation>,
        conditions: &[Condition],
    ) -> AggregationReport {
        let entries: Vec<(&ParticipantId, &Observation)> = observations.iter().collect();
        let scored: Vec<(ParticipantAccuracies, Vec<Diagnostic>)> = entries
            .par_iter()
            .map(|(participant, observation)| {
                self.score_participant(**participant, observation, conditions)
            })
            .collect();

        let mut report = AggregationReport {
            participants: Vec::with_capacity(scored.len()),
            diagnostics: self.overlap_diagnostics(conditions),
        };
        for (accuracies, diagnostics) in scored {
            report.participants.push(accuracies);
            report.diagnostics.extend(diagnostics);
        }

        for diagnostic in &report.diagnostics {
            self.emit(diagnostic);
        }
        debug!(
            participants = report.participants.len(),
            conditions = conditions.len(),
            diagnostics = report.diagnostics.len(),
            "observations aggregated"
        );
        report
    }

    fn score_participant(
        &self,
        participant: ParticipantId,
        observation: &Observation,
        conditions: &[Condition],
    ) -> (ParticipantAccuracies, Vec<Diagnostic>) {
        let mut diagnostics = Vec::new();
        let accuracies = conditions
            .iter()
            .map(|condition| {
                let scored = self.score(observation, *condition);
                if scored.matched == 0 {
                    diagnostics
                        .push(Diagnostic::no_matching_trials(participant, condition.value()));
                }
                scored
            })
            .collect();
        (
            ParticipantAccuracies {
                participant,
                accuracies,
            },
            diagnostics,
        )
    }

    /// Pairs of conditions whose matching bands can overlap.
    fn overlap_diagnostics(&self, conditions: &[Condition]) -> Vec<Diagnostic> {
        let scale = self.fields.value_scale;
        let mut found = Vec::new();
        for (i, a) in conditions.iter().enumerate() {
            for b in &conditions[i + 1..] {
                let spacing = a.distance(*b) * scale;
                if spacing < 2.0 * self.tolerance {
                    found.push(Diagnostic::ambiguous_match(
                        a.value(),
                        b.value(),
                        spacing,
                        self.tolerance,
                    ));
                }
            }
        }
        found
    }

    fn is_relevant(&self, record: &Value) -> bool {
        record
            .get(&self.fields.trial_type_field)
            .and_then(Value::as_str)
            .map(|t| t == self.fields.trial_type)
            .unwrap_or(false)
    }

    fn emit(&self, diagnostic: &Diagnostic) {
        match diagnostic.severity {
            DiagnosticSeverity::Warning => {
                warn!(message = %diagnostic.message, "aggregation warning")
            }
            DiagnosticSeverity::Info => info!(message = %diagnostic.message, "aggregation note"),
        }
        if let Some(tx) = &self.diagnostics_tx {
            // Receiver may be gone; the entry is still in the report.
            let _ = tx.try_send(diagnostic.clone());
        }
    }
}

fn is_correct(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}
