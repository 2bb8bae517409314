//! # ac-sampler
//!
//! Condition sampling for the closed loop: seeded uniform draws on the first
//! cycle, then oversampled pools refined by maximum summed dissimilarity to
//! everything sampled so far.

mod dissimilarity;
mod sampler;

pub use dissimilarity::{select_most_dissimilar, DissimilarityScore};
pub use sampler::{ConditionSampler, SamplingStrategy, UniformSampler};
