//! Invokes the acceptance sampler, concatenates non-speculative results,
//! reorders to original batch order, and updates the hidden-state buffer
//! (spec.md §4.F).

use std::collections::HashMap;

use candle_core::{Device, Tensor};

use crate::batch_partition::partition_by_proposal_len;
use crate::error::{CoordinatorError, Result};
use crate::hidden_state_buffer::HiddenStateBuffer;
use crate::tensor_util::{reorder_rows, select_rows};
use crate::traits::{AcceptanceSampler, SeededSeqs};
use crate::types::{SequenceMetadata, SpeculativeProposals, SpeculativeScores, NO_TOKEN};

pub struct Verifier<'a> {
    pub sampler: &'a dyn AcceptanceSampler,
    pub device: Device,
}

pub struct VerifyOutput {
    pub accepted_token_ids: Tensor,
    pub target_logprobs: Tensor,
}

impl<'a> Verifier<'a> {
    pub fn new(sampler: &'a dyn AcceptanceSampler, device: Device) -> Self {
        Self { sampler, device }
    }

    /// spec.md §4.F, steps 1-6: runs the acceptance sampler and returns the
    /// accepted-token matrix back in original batch order, plus the target
    /// logprobs tensor unchanged (it is already full-batch, [k+1]-wide).
    pub fn verify_tokens(
        &self,
        seq_group_metadata: &[SequenceMetadata],
        proposal_scores: &SpeculativeScores,
        proposals: &SpeculativeProposals,
        max_proposal_len: usize,
        hidden_buffer: &mut HiddenStateBuffer,
    ) -> Result<VerifyOutput> {
        let partition = partition_by_proposal_len(&proposals.proposal_lens);
        let original_order = partition.original_order();

        let proposal_verifier_probs =
            select_rows(&proposal_scores.probs, &partition.spec_indices, &self.device)?;
        let non_spec_token_ids =
            select_rows(&proposal_scores.token_ids, &partition.non_spec_indices, &self.device)?;
        let spec_token_ids_full =
            select_rows(&proposal_scores.token_ids, &partition.spec_indices, &self.device)?;
        let k_plus_1 = spec_token_ids_full.dims2()?.1;
        let bonus_token_ids = spec_token_ids_full.narrow(1, k_plus_1 - 1, 1)?;

        let proposal_probs = select_rows(&proposals.proposal_probs, &partition.spec_indices, &self.device)?;
        let proposal_token_ids =
            select_rows(&proposals.proposal_token_ids, &partition.spec_indices, &self.device)?;

        let seeded_seqs = self.build_seeded_seqs(seq_group_metadata, &partition.spec_indices);

        let accepted_spec = self.sampler.sample(
            &proposal_verifier_probs,
            &bonus_token_ids,
            &proposal_probs,
            &proposal_token_ids,
            seeded_seqs.as_ref(),
        )?;
        self.validate_pad_invariant(&accepted_spec)?;

        let accepted_spec_shape = accepted_spec.dims2()?;
        if accepted_spec_shape.1 != max_proposal_len + 1 {
            return Err(CoordinatorError::InvariantViolation(format!(
                "acceptance sampler returned width {} but expected k+1 = {}",
                accepted_spec_shape.1,
                max_proposal_len + 1
            )));
        }

        // Expand non_spec_token_ids to width k+1: keep column 0, pad 1..k with -1.
        let non_spec_count = partition.non_spec_indices.len();
        let first_col = non_spec_token_ids.narrow(1, 0, 1)?.to_vec2::<i64>()?;
        let mut expanded = vec![NO_TOKEN; non_spec_count * (max_proposal_len + 1)];
        for (row, col0) in first_col.iter().enumerate() {
            expanded[row * (max_proposal_len + 1)] = col0[0];
        }
        let non_spec_expanded =
            Tensor::from_vec(expanded, (non_spec_count, max_proposal_len + 1), &self.device)?;

        let accepted_combined = Tensor::cat(&[&accepted_spec, &non_spec_expanded], 0)?;
        let accepted_token_ids = reorder_rows(&accepted_combined, &original_order, &self.device)?;

        if let Some(hidden) = &proposal_scores.hidden_states {
            self.update_hidden_buffer(seq_group_metadata, hidden, &accepted_token_ids, hidden_buffer)?;
        }

        Ok(VerifyOutput {
            accepted_token_ids,
            target_logprobs: proposal_scores.logprobs.clone(),
        })
    }

    fn build_seeded_seqs(
        &self,
        seq_group_metadata: &[SequenceMetadata],
        spec_indices: &[usize],
    ) -> Option<SeededSeqs> {
        if !self.sampler.is_stochastic() {
            return None;
        }
        let mut map = SeededSeqs::new();
        for (local_idx, &global_idx) in spec_indices.iter().enumerate() {
            if let Some(seed) = seq_group_metadata[global_idx].sampling_params.seed {
                map.insert(local_idx, seed);
            }
        }
        if map.is_empty() {
            None
        } else {
            Some(map)
        }
    }

    /// spec.md §3 Invariant 3 / §8 testable property 3: positions after the
    /// first NO_TOKEN in a row must also be NO_TOKEN.
    fn validate_pad_invariant(&self, accepted: &Tensor) -> Result<()> {
        let rows = accepted.to_vec2::<i64>()?;
        for row in &rows {
            let mut seen_pad = false;
            for &v in row {
                if seen_pad && v != NO_TOKEN {
                    return Err(CoordinatorError::InvariantViolation(
                        "accepted token row has a non-pad token after its first pad".into(),
                    ));
                }
                seen_pad |= v == NO_TOKEN;
            }
        }
        Ok(())
    }

    /// spec.md §4.F step 7: select the accepted-position hidden state (and
    /// the second-to-last one) for every `do_sample` sequence, skipping rows
    /// that accepted nothing.
    fn update_hidden_buffer(
        &self,
        seq_group_metadata: &[SequenceMetadata],
        hidden_states: &Tensor,
        accepted_token_ids: &Tensor,
        hidden_buffer: &mut HiddenStateBuffer,
    ) -> Result<()> {
        let accepted_rows = accepted_token_ids.to_vec2::<i64>()?;
        // count_nonzero(accepted + 1, axis=1) - 1: the position of the last
        // accepted (non-pad) token, or -1 if the row accepted nothing.
        let accepted_index: Vec<i64> = accepted_rows
            .iter()
            .map(|row| row.iter().filter(|&&v| v != NO_TOKEN).count() as i64 - 1)
            .collect();

        let keep_rows: Vec<usize> = accepted_index
            .iter()
            .enumerate()
            .filter(|&(_, &idx)| idx != NO_TOKEN)
            .map(|(i, _)| i)
            .collect();

        let terminal_metadata: Vec<SequenceMetadata> = seq_group_metadata
            .iter()
            .filter(|m| m.do_sample)
            .cloned()
            .collect();
        if keep_rows.len() != terminal_metadata.len() {
            return Err(CoordinatorError::InvariantViolation(format!(
                "expected {} terminal hidden-state rows, found {}",
                terminal_metadata.len(),
                keep_rows.len()
            )));
        }

        let filtered_hidden = select_rows(hidden_states, &keep_rows, &self.device)?;
        let (rows, k_plus_1, dim) = filtered_hidden.dims3()?;
        let second_last = if k_plus_1 >= 2 {
            Some(filtered_hidden.narrow(1, k_plus_1 - 2, 1)?.reshape((rows, dim))?)
        } else {
            None
        };

        let idx: Vec<u32> = keep_rows.iter().map(|&r| accepted_index[r] as u32).collect();
        let idx_tensor = Tensor::from_vec(idx, (rows, 1, 1), &self.device)?
            .broadcast_as((rows, 1, dim))?
            .contiguous()?;
        let gathered = filtered_hidden
            .gather(&idx_tensor, 1)?
            .reshape((rows, dim))?;

        hidden_buffer.update_with_second_last(&gathered, second_last.as_ref(), &terminal_metadata)?;
        Ok(())
    }
}

/// Builds the `request_id -> [seq_id]` map observed this step, used by
/// [`crate::bonus_tokens::BonusTokenTracker::update`].
pub fn request_seq_ids_this_step(
    seq_group_metadata: &[SequenceMetadata],
) -> HashMap<String, Vec<u64>> {
    let mut map: HashMap<String, Vec<u64>> = HashMap::new();
    for meta in seq_group_metadata {
        map.entry(meta.request_id.clone()).or_default().push(meta.seq_id);
    }
    map
}
