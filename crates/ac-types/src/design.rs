//! Experimental design: factors, trials, and the block / participant hierarchy.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use crate::condition::Condition;
use crate::errors::{AcError, AcResult};

/// A named categorical variable with an enumerated domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    pub name: String,
    pub levels: Vec<Value>,
}

impl Factor {
    pub fn new(name: impl Into<String>, levels: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            levels,
        }
    }
}

/// The set of factors crossed to form trials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Design {
    pub factors: Vec<Factor>,
}

impl Design {
    pub fn new() -> Self {
        Self {
            factors: Vec::new(),
        }
    }

    pub fn with_factor(mut self, name: impl Into<String>, levels: Vec<Value>) -> Self {
        self.factors.push(Factor::new(name, levels));
        self
    }

    /// Number of cells in the full cross. Overflow saturates; validation
    /// rejects such designs anyway.
    pub fn cell_count(&self) -> usize {
        self.factors
            .iter()
            .try_fold(1usize, |acc, f| acc.checked_mul(f.levels.len()))
            .unwrap_or(usize::MAX)
    }

    /// Level counts per factor, in factor order.
    pub fn level_counts(&self) -> Vec<usize> {
        self.factors.iter().map(|f| f.levels.len()).collect()
    }

    pub fn validate(&self) -> AcResult<()> {
        if self.factors.is_empty() {
            return Err(AcError::InvalidParameter(
                "design needs at least one factor".into(),
            ));
        }
        let mut seen = HashSet::new();
        for factor in &self.factors {
            if factor.name.is_empty() {
                return Err(AcError::InvalidParameter("factor name is empty".into()));
            }
            if !seen.insert(factor.name.as_str()) {
                return Err(AcError::InvalidParameter(format!(
                    "duplicate factor name: {}",
                    factor.name
                )));
            }
            if factor.levels.is_empty() {
                return Err(AcError::InvalidParameter(format!(
                    "factor {} has no levels",
                    factor.name
                )));
            }
        }
        if self.cell_count() == usize::MAX {
            return Err(AcError::InvalidParameter("design cross is too large".into()));
        }
        Ok(())
    }
}

impl Default for Design {
    /// Movement direction crossed with orientation, both in {0°, 180°}.
    fn default() -> Self {
        Self::new()
            .with_factor("dir_mov", vec![Value::from(0), Value::from(180)])
            .with_factor("dir_or", vec![Value::from(0), Value::from(180)])
    }
}

/// One realization of the design's factor combination.
///
/// Serializes flat: `{"dir_mov": 0, "dir_or": 180, "condition": 0.42}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(flatten)]
    pub levels: BTreeMap<String, Value>,
}

impl Trial {
    pub fn new(levels: BTreeMap<String, Value>) -> Self {
        Self {
            condition: None,
            levels,
        }
    }

    pub fn level(&self, factor: &str) -> Option<&Value> {
        self.levels.get(factor)
    }
}

/// A contiguous run of trials sharing one condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Block {
    pub trials: Vec<Trial>,
}

impl Block {
    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }
}

/// All blocks assigned to one participant slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantBatch {
    pub slot: usize,
    pub blocks: Vec<Block>,
}

impl ParticipantBatch {
    /// Trials of every block, in order.
    pub fn trials(&self) -> impl Iterator<Item = &Trial> {
        self.blocks.iter().flat_map(|b| b.trials.iter())
    }

    pub fn trial_count(&self) -> usize {
        self.blocks.iter().map(Block::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_design_is_two_by_two() {
        let design = Design::default();
        assert_eq!(design.cell_count(), 4);
        assert_eq!(design.level_counts(), vec![2, 2]);
        assert!(design.validate().is_ok());
    }

    #[test]
    fn design_validation_rejects_bad_factors() {
        assert!(Design::new().validate().is_err());
        assert!(Design::new().with_factor("a", vec![]).validate().is_err());

        let dup = Design::new()
            .with_factor("a", vec![json!(1)])
            .with_factor("a", vec![json!(2)]);
        assert!(dup.validate().is_err());
    }

    #[test]
    fn trial_serializes_flat() {
        let mut levels = BTreeMap::new();
        levels.insert("dir_mov".to_string(), json!(0));
        levels.insert("dir_or".to_string(), json!(180));
        let mut trial = Trial::new(levels);
        trial.condition = Some(Condition::new(0.5).unwrap());

        let value = serde_json::to_value(&trial).unwrap();
        assert_eq!(value, json!({"dir_mov": 0, "dir_or": 180, "condition": 0.5}));

        let back: Trial = serde_json::from_value(value).unwrap();
        assert_eq!(back, trial);
    }

    #[test]
    fn batch_iterates_blocks_in_order() {
        let trial = |v: i64| {
            let mut levels = BTreeMap::new();
            levels.insert("x".to_string(), json!(v));
            Trial::new(levels)
        };
        let batch = ParticipantBatch {
            slot: 0,
            blocks: vec![
                Block {
                    trials: vec![trial(1), trial(2)],
                },
                Block {
                    trials: vec![trial(3)],
                },
            ],
        };
        let order: Vec<_> = batch.trials().map(|t| t.level("x").cloned()).collect();
        assert_eq!(order, vec![Some(json!(1)), Some(json!(2)), Some(json!(3))]);
        assert_eq!(batch.trial_count(), 3);
    }
}
