//! # ac-design
//!
//! Expands a [`Design`](ac_types::Design) into counterbalanced trial
//! sequences, slices them into blocks and participant batches, and labels
//! each block with its condition.

mod crossing;
mod partition;
mod synthesizer;

pub use crossing::{cross, Cell};
pub use partition::{attach_conditions, flatten, partition};
pub use synthesizer::{SequenceSynthesizer, SynthesisReport};
