//! Run configuration and its validation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::design::Design;
use crate::errors::{AcError, AcResult};

/// Environment variable naming a JSON config file.
pub const CONFIG_PATH_ENV: &str = "AUTOCYCLE_CONFIG";
/// Environment override for `random_seed`.
pub const SEED_ENV: &str = "AUTOCYCLE_SEED";
/// Environment override for `cycles_total`.
pub const CYCLES_ENV: &str = "AUTOCYCLE_CYCLES";

/// Top-level configuration for a closed-loop run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub cycles_total: usize,
    pub blocks_per_participant: usize,
    pub participants_per_cycle: usize,
    /// Candidate pool size as a multiple of the batch size.
    pub oversampling_factor: f64,
    pub reclaim_timeout_seconds: f64,
    /// Absolute tolerance on the scaled field range.
    pub match_tolerance: f64,
    pub random_seed: u64,

    pub trials_per_block: usize,
    pub min_trials_per_cell: usize,
    pub poll_interval_seconds: f64,
    /// Optional wall-clock cap on the whole run.
    pub run_deadline_seconds: Option<f64>,

    pub design: Design,
    pub aggregation: AggregationFields,
    pub retry: RetryConfig,
    pub backend: BackendConfig,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            cycles_total: 5,
            blocks_per_participant: 3,
            participants_per_cycle: 4,
            oversampling_factor: 50.0,
            reclaim_timeout_seconds: 100.0,
            match_tolerance: 0.1,
            random_seed: 180,
            trials_per_block: 8,
            min_trials_per_cell: 2,
            poll_interval_seconds: 5.0,
            run_deadline_seconds: None,
            design: Design::default(),
            aggregation: AggregationFields::default(),
            retry: RetryConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl CycleConfig {
    pub fn with_cycles(mut self, n: usize) -> Self {
        self.cycles_total = n;
        self
    }

    pub fn with_participants(mut self, n: usize) -> Self {
        self.participants_per_cycle = n;
        self
    }

    pub fn with_blocks(mut self, blocks_per_participant: usize, trials_per_block: usize) -> Self {
        self.blocks_per_participant = blocks_per_participant;
        self.trials_per_block = trials_per_block;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn with_poll_interval(mut self, seconds: f64) -> Self {
        self.poll_interval_seconds = seconds;
        self
    }

    pub fn with_reclaim_timeout(mut self, seconds: f64) -> Self {
        self.reclaim_timeout_seconds = seconds;
        self
    }

    pub fn with_run_deadline(mut self, seconds: f64) -> Self {
        self.run_deadline_seconds = Some(seconds);
        self
    }

    pub fn with_design(mut self, design: Design) -> Self {
        self.design = design;
        self
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Trials synthesized per cycle across all participants.
    pub fn total_trials(&self) -> usize {
        self.trials_per_block * self.blocks_per_participant * self.participants_per_cycle
    }

    /// Load from a JSON file; absent keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> AcResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Load from `AUTOCYCLE_CONFIG` if set, then apply env overrides and validate.
    pub fn from_env() -> AcResult<Self> {
        let base = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_json_file(path)?,
            Err(_) => Self::default(),
        };
        let config = base.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_env_overrides<F>(mut self, lookup: F) -> AcResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(SEED_ENV) {
            self.random_seed = raw.trim().parse().map_err(|_| {
                AcError::InvalidParameter(format!("{SEED_ENV} must be an integer, got {raw:?}"))
            })?;
        }
        if let Some(raw) = lookup(CYCLES_ENV) {
            self.cycles_total = raw.trim().parse().map_err(|_| {
                AcError::InvalidParameter(format!("{CYCLES_ENV} must be an integer, got {raw:?}"))
            })?;
        }
        Ok(self)
    }

    /// Reject bad values before any side effect.
    pub fn validate(&self) -> AcResult<()> {
        positive_count("cycles_total", self.cycles_total)?;
        positive_count("blocks_per_participant", self.blocks_per_participant)?;
        positive_count("participants_per_cycle", self.participants_per_cycle)?;
        positive_count("trials_per_block", self.trials_per_block)?;
        positive_count("min_trials_per_cell", self.min_trials_per_cell)?;

        if !self.oversampling_factor.is_finite() || self.oversampling_factor < 1.0 {
            return Err(AcError::InvalidParameter(format!(
                "oversampling_factor must be >= 1, got {}",
                self.oversampling_factor
            )));
        }
        positive_seconds("reclaim_timeout_seconds", self.reclaim_timeout_seconds)?;
        positive_seconds("poll_interval_seconds", self.poll_interval_seconds)?;
        if let Some(deadline) = self.run_deadline_seconds {
            positive_seconds("run_deadline_seconds", deadline)?;
        }
        if !self.match_tolerance.is_finite() || self.match_tolerance <= 0.0 {
            return Err(AcError::InvalidParameter(format!(
                "match_tolerance must be positive, got {}",
                self.match_tolerance
            )));
        }

        self.design.validate()?;
        self.aggregation.validate()?;
        self.retry.validate()?;
        self.backend.validate()?;
        Ok(())
    }
}

fn positive_count(name: &str, value: usize) -> AcResult<()> {
    if value == 0 {
        return Err(AcError::InvalidParameter(format!("{name} must be positive")));
    }
    Ok(())
}

fn positive_seconds(name: &str, value: f64) -> AcResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(AcError::InvalidParameter(format!(
            "{name} must be a positive number of seconds, got {value}"
        )));
    }
    Ok(())
}

/// Where the aggregator finds the relevant values inside each raw trial record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationFields {
    /// Only records of this category are scored.
    pub trial_type: String,
    pub trial_type_field: String,
    /// Numeric field compared against the scaled condition.
    pub value_field: String,
    pub correct_field: String,
    /// Conditions are multiplied by this before matching.
    pub value_scale: f64,
}

impl Default for AggregationFields {
    fn default() -> Self {
        Self {
            trial_type: "rok".to_string(),
            trial_type_field: "trial_type".to_string(),
            value_field: "coherence_movement".to_string(),
            correct_field: "correct".to_string(),
            value_scale: 100.0,
        }
    }
}

impl AggregationFields {
    pub fn validate(&self) -> AcResult<()> {
        if !self.value_scale.is_finite() || self.value_scale <= 0.0 {
            return Err(AcError::InvalidParameter(format!(
                "aggregation.value_scale must be positive, got {}",
                self.value_scale
            )));
        }
        if self.value_field.is_empty() || self.correct_field.is_empty() {
            return Err(AcError::InvalidParameter(
                "aggregation field names cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Bounded exponential backoff for transient backend failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; 0 disables retrying.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> AcResult<()> {
        if self.initial_backoff_ms == 0 || self.initial_backoff_ms > self.max_backoff_ms {
            return Err(AcError::InvalidParameter(format!(
                "retry backoff must satisfy 0 < initial ({}) <= max ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }
}

/// Which remote backend the run talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process backend with simulated participants.
    Sandbox(SandboxSettings),
    /// REST/JSON study service.
    Http {
        base_url: String,
        /// Passed through verbatim on every request; never interpreted.
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default = "default_request_timeout")]
        request_timeout_seconds: f64,
    },
}

fn default_request_timeout() -> f64 {
    30.0
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Sandbox(SandboxSettings::default())
    }
}

impl BackendConfig {
    pub fn validate(&self) -> AcResult<()> {
        match self {
            BackendConfig::Sandbox(settings) => settings.validate(),
            BackendConfig::Http {
                base_url,
                request_timeout_seconds,
                ..
            } => {
                if base_url.is_empty() {
                    return Err(AcError::InvalidParameter(
                        "backend.base_url cannot be empty".into(),
                    ));
                }
                positive_seconds("backend.request_timeout_seconds", *request_timeout_seconds)
            }
        }
    }
}

/// Behaviour of the simulated participants in the sandbox backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// New participants that join open slots per poll.
    pub arrivals_per_poll: usize,
    /// Probability that a participant abandons the session without submitting.
    pub abandon_probability: f64,
    pub seed: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            arrivals_per_poll: 1,
            abandon_probability: 0.0,
            seed: 7,
        }
    }
}

impl SandboxSettings {
    pub fn validate(&self) -> AcResult<()> {
        if !(0.0..1.0).contains(&self.abandon_probability) {
            return Err(AcError::InvalidParameter(format!(
                "sandbox.abandon_probability must be in [0, 1), got {}",
                self.abandon_probability
            )));
        }
        Ok(())
    }
}
