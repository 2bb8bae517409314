use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{AcError, AcResult};

/// A controlled parameter value in the unit interval (e.g. a coherence level).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Condition(f64);

impl Condition {
    pub fn new(value: f64) -> AcResult<Self> {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(AcError::InvalidParameter(format!(
                "condition must lie in [0, 1], got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// The condition expressed on a field scale (e.g. 0.42 -> 42 on a 0-100 scale).
    pub fn scaled(self, scale: f64) -> f64 {
        self.0 * scale
    }

    /// Absolute distance between two conditions.
    pub fn distance(self, other: Condition) -> f64 {
        (self.0 - other.0).abs()
    }
}

impl TryFrom<f64> for Condition {
    type Error = AcError;

    fn try_from(value: f64) -> AcResult<Self> {
        Self::new(value)
    }
}

impl From<Condition> for f64 {
    fn from(c: Condition) -> Self {
        c.0
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

/// The ordered conditions for one cycle, one per block. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionBatch {
    conditions: Vec<Condition>,
}

impl ConditionBatch {
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    pub fn as_slice(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Condition> {
        self.conditions.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = Condition> + '_ {
        self.conditions.iter().copied()
    }

    pub fn values(&self) -> Vec<f64> {
        self.conditions.iter().map(|c| c.value()).collect()
    }

    /// Smallest gap between any two conditions in the batch, `None` for fewer
    /// than two conditions.
    pub fn min_spacing(&self) -> Option<f64> {
        let mut sorted = self.values();
        sorted.sort_by(|a, b| a.total_cmp(b));
        sorted
            .windows(2)
            .map(|w| w[1] - w[0])
            .min_by(|a, b| a.total_cmp(b))
    }
}

impl From<Vec<Condition>> for ConditionBatch {
    fn from(conditions: Vec<Condition>) -> Self {
        Self::new(conditions)
    }
}
