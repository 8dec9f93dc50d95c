//! Splits a step's sequences by proposal length into speculative and
//! non-speculative lanes (spec.md §4.D).

use crate::types::SequenceMetadata;

/// `spec_indices` (proposal_len > 0) and `non_spec_indices` (proposal_len ==
/// 0), each preserving the original order. Does not mutate the input
/// metadata list (spec.md §9 Batch partitioning).
#[derive(Clone, Debug)]
pub struct BatchPartition {
    pub spec_indices: Vec<usize>,
    pub non_spec_indices: Vec<usize>,
}

impl BatchPartition {
    /// `original_order = spec_indices ++ non_spec_indices`, used as the
    /// permutation to restore row order after verification.
    pub fn original_order(&self) -> Vec<usize> {
        let mut order = self.spec_indices.clone();
        order.extend_from_slice(&self.non_spec_indices);
        order
    }
}

pub fn partition_by_proposal_len(proposal_lens: &[usize]) -> BatchPartition {
    let mut spec_indices = Vec::new();
    let mut non_spec_indices = Vec::new();
    for (i, &len) in proposal_lens.iter().enumerate() {
        if len > 0 {
            spec_indices.push(i);
        } else {
            non_spec_indices.push(i);
        }
    }
    BatchPartition {
        spec_indices,
        non_spec_indices,
    }
}

/// The subset of `non_spec_indices` whose metadata says `is_prompt`, used
/// before the proposer-sync-for-prefill sub-step (spec.md §4.D, §4.G).
pub fn prefill_only(non_spec_indices: &[usize], seq_group_metadata: &[SequenceMetadata]) -> Vec<usize> {
    non_spec_indices
        .iter()
        .copied()
        .filter(|&idx| seq_group_metadata[idx].is_prompt)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SamplingParams;

    fn meta(is_prompt: bool) -> SequenceMetadata {
        SequenceMetadata {
            request_id: "r".into(),
            seq_id: 0,
            is_prompt,
            do_sample: true,
            num_speculative_tokens: 0,
            token_chunk_size: 1,
            num_computed_tokens: 0,
            sampling_params: SamplingParams::default(),
        }
    }

    #[test]
    fn scenario_3_mixed_batch_order() {
        // [prefill P, decode D], proposal_lens=[0,3]
        let part = partition_by_proposal_len(&[0, 3]);
        assert_eq!(part.spec_indices, vec![1]);
        assert_eq!(part.non_spec_indices, vec![0]);
        assert_eq!(part.original_order(), vec![1, 0]);
    }

    #[test]
    fn preserves_order_within_each_lane() {
        let part = partition_by_proposal_len(&[3, 0, 3, 0, 0]);
        assert_eq!(part.spec_indices, vec![0, 2]);
        assert_eq!(part.non_spec_indices, vec![1, 3, 4]);
    }

    #[test]
    fn prefill_only_filters_decodes_out_of_non_spec() {
        let metas = vec![meta(true), meta(false), meta(true)];
        let non_spec = vec![0, 1, 2];
        assert_eq!(prefill_only(&non_spec, &metas), vec![0, 2]);
    }
}
