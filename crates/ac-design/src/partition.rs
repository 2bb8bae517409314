//! Order-preserving slicing of a synthesized sequence into blocks and
//! participant batches, and the condition label pass.

use ac_types::{Block, ConditionBatch, ParticipantBatch, SynthesisError, Trial};

/// Slice `trials` into `participants` batches of `blocks_per_participant`
/// equal blocks. Pure index arithmetic; the order is never changed.
pub fn partition(
    trials: Vec<Trial>,
    participants: usize,
    blocks_per_participant: usize,
) -> Result<Vec<ParticipantBatch>, SynthesisError> {
    if participants == 0 || blocks_per_participant == 0 {
        return Err(SynthesisError::InvalidConstraint {
            message: "participant and block counts must be positive".into(),
        });
    }
    let blocks_total = participants * blocks_per_participant;
    if trials.is_empty() || trials.len() % blocks_total != 0 {
        return Err(SynthesisError::InvalidConstraint {
            message: format!(
                "{} trials cannot be split into {blocks_total} equal blocks",
                trials.len()
            ),
        });
    }
    let block_size = trials.len() / blocks_total;

    let mut blocks = Vec::with_capacity(blocks_total);
    let mut rest = trials.into_iter();
    for _ in 0..blocks_total {
        blocks.push(Block {
            trials: rest.by_ref().take(block_size).collect(),
        });
    }

    let mut batches = Vec::with_capacity(participants);
    let mut rest = blocks.into_iter();
    for slot in 0..participants {
        batches.push(ParticipantBatch {
            slot,
            blocks: rest.by_ref().take(blocks_per_participant).collect(),
        });
    }
    Ok(batches)
}

/// Label every trial with the condition at its block's position.
pub fn attach_conditions(
    mut batches: Vec<ParticipantBatch>,
    conditions: &ConditionBatch,
) -> Result<Vec<ParticipantBatch>, SynthesisError> {
    for batch in &mut batches {
        if batch.blocks.len() != conditions.len() {
            return Err(SynthesisError::InvalidConstraint {
                message: format!(
                    "slot {} has {} blocks but the batch holds {} conditions",
                    batch.slot,
                    batch.blocks.len(),
                    conditions.len()
                ),
            });
        }
        for (block, condition) in batch.blocks.iter_mut().zip(conditions.iter()) {
            for trial in &mut block.trials {
                trial.condition = Some(condition);
            }
        }
    }
    Ok(batches)
}

/// Concatenate every batch's blocks' trials in order.
pub fn flatten(batches: &[ParticipantBatch]) -> Vec<Trial> {
    batches.iter().flat_map(|b| b.trials().cloned()).collect()
}
