//! Raw participant logs as returned by the remote backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::errors::{AcError, AcResult};

/// Backend-assigned participant identifier. Ordering defines aggregation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u32);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// One participant's ordered trial log. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    trials: Vec<Value>,
}

impl Observation {
    pub fn new(trials: Vec<Value>) -> Self {
        Self { trials }
    }

    /// Parse a submitted log. Accepts `{"trials": [...]}` or a bare array.
    pub fn from_json(raw: &str) -> AcResult<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> AcResult<Self> {
        match value {
            Value::Array(trials) => Ok(Self::new(trials)),
            Value::Object(mut map) => match map.remove("trials") {
                Some(Value::Array(trials)) => Ok(Self::new(trials)),
                _ => Err(AcError::InvalidParameter(
                    "observation object has no `trials` array".into(),
                )),
            },
            other => Err(AcError::InvalidParameter(format!(
                "observation must be an object or array, got {other}"
            ))),
        }
    }

    pub fn trials(&self) -> &[Value] {
        &self.trials
    }

    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }
}
