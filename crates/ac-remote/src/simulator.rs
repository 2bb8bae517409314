//! Synthetic participants for the sandbox backend.

use ac_types::{Condition, Observation, ParticipantBatch, SandboxSettings};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{json, Map, Value};

/// Plays through a participant batch and produces a jsPsych-style log.
///
/// Each trial yields a fixation record followed by a `rok` response record
/// whose `coherence_movement` is the condition in percent. A response is
/// correct with probability `0.5 + 0.5 * condition`.
#[derive(Debug, Clone)]
pub struct ParticipantSimulator {
    rng: ChaCha8Rng,
    abandon_probability: f64,
}

impl ParticipantSimulator {
    pub fn new(seed: u64, abandon_probability: f64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            abandon_probability: abandon_probability.clamp(0.0, 1.0),
        }
    }

    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self::new(settings.seed, settings.abandon_probability)
    }

    /// Probability of a correct response at a given coherence in [0, 1].
    pub fn p_correct(coherence: f64) -> f64 {
        (0.5 + 0.5 * coherence).clamp(0.0, 1.0)
    }

    /// Whether the next arriving participant walks away without submitting.
    pub fn abandons(&mut self) -> bool {
        self.abandon_probability > 0.0 && self.rng.gen_bool(self.abandon_probability)
    }

    pub fn run_session(&mut self, batch: &ParticipantBatch) -> Observation {
        let mut records = Vec::with_capacity(batch.trial_count() * 2);
        for trial in batch.trials() {
            records.push(json!({
                "trial_type": "html-keyboard-response",
                "stimulus": "+",
                "trial_index": records.len(),
            }));

            let coherence = trial.condition.map(Condition::value).unwrap_or(0.0);
            let correct = self.rng.gen_bool(Self::p_correct(coherence));
            let rt: u32 = self.rng.gen_range(250..1500);

            let mut record: Map<String, Value> = trial.levels.clone().into_iter().collect();
            record.insert("trial_type".into(), json!("rok"));
            record.insert("trial_index".into(), json!(records.len()));
            record.insert("coherence_movement".into(), json!(coherence * 100.0));
            record.insert("correct".into(), json!(correct));
            record.insert("rt".into(), json!(rt));
            records.push(Value::Object(record));
        }
        Observation::new(records)
    }
}
