//! Seeded condition samplers.

use ac_types::{Condition, SamplingError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::dissimilarity::select_most_dissimilar;

/// Common trait for condition sampling strategies.
///
/// Samplers own their generator; `&mut self` keeps draws sequential.
pub trait SamplingStrategy: Send {
    /// Produce the next `batch_size` conditions given everything sampled so far.
    fn sample(
        &mut self,
        previous: &[Condition],
        batch_size: usize,
    ) -> Result<Vec<Condition>, SamplingError>;

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

// ---- Uniform ----

/// Independent uniform draws over [0, 1], ignoring history.
#[derive(Debug, Clone)]
pub struct UniformSampler {
    rng: ChaCha8Rng,
}

impl UniformSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    fn draw(&mut self, n: usize) -> Result<Vec<Condition>, SamplingError> {
        (0..n)
            .map(|_| {
                let v: f64 = self.rng.gen_range(0.0..=1.0);
                Condition::new(v).map_err(|e| SamplingError::InvalidParameter {
                    message: e.to_string(),
                })
            })
            .collect()
    }
}

impl SamplingStrategy for UniformSampler {
    fn sample(
        &mut self,
        _previous: &[Condition],
        batch_size: usize,
    ) -> Result<Vec<Condition>, SamplingError> {
        check_batch_size(batch_size)?;
        self.draw(batch_size)
    }

    fn name(&self) -> &str {
        "uniform"
    }
}

// ---- Uniform, then dissimilarity-refined ----

/// Uniform on the first call; afterwards draws an oversampled pool and keeps
/// the entries farthest from `previous`.
#[derive(Debug, Clone)]
pub struct ConditionSampler {
    uniform: UniformSampler,
    oversampling_factor: f64,
}

impl ConditionSampler {
    pub const DEFAULT_OVERSAMPLING: f64 = 50.0;

    pub fn new(seed: u64) -> Self {
        Self {
            uniform: UniformSampler::new(seed),
            oversampling_factor: Self::DEFAULT_OVERSAMPLING,
        }
    }

    pub fn with_oversampling(mut self, factor: f64) -> Result<Self, SamplingError> {
        if !factor.is_finite() || factor < 1.0 {
            return Err(SamplingError::InvalidParameter {
                message: format!("oversampling factor must be >= 1, got {factor}"),
            });
        }
        self.oversampling_factor = factor;
        Ok(self)
    }

    pub fn oversampling_factor(&self) -> f64 {
        self.oversampling_factor
    }

    fn pool_size(&self, batch_size: usize) -> usize {
        (batch_size as f64 * self.oversampling_factor).ceil() as usize
    }
}

impl SamplingStrategy for ConditionSampler {
    fn sample(
        &mut self,
        previous: &[Condition],
        batch_size: usize,
    ) -> Result<Vec<Condition>, SamplingError> {
        check_batch_size(batch_size)?;

        if previous.is_empty() {
            return self.uniform.draw(batch_size);
        }

        let pool_size = self.pool_size(batch_size);
        let pool = self.uniform.draw(pool_size)?;
        if pool.is_empty() || pool.len() < batch_size {
            return Err(SamplingError::EmptyPool {
                batch_size,
                factor: self.oversampling_factor,
            });
        }

        let selected = select_most_dissimilar(&pool, previous, batch_size);
        debug!(
            pool = pool.len(),
            reference = previous.len(),
            selected = selected.len(),
            "dissimilarity selection"
        );
        Ok(selected)
    }

    fn name(&self) -> &str {
        "dissimilarity"
    }
}

fn check_batch_size(batch_size: usize) -> Result<(), SamplingError> {
    if batch_size == 0 {
        return Err(SamplingError::InvalidParameter {
            message: "batch size must be positive".into(),
        });
    }
    Ok(())
}
