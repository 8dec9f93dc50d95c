//! Converts the acceptance tensor plus logprob tensors into per-step,
//! per-sequence output records (spec.md §4.E).
//!
//! This is the one place in the coordinator that serializes device tensors
//! to the host (spec.md §9 design notes) — everywhere else, probability
//! tensors stay on device for the acceptance sampler to consume directly.

use candle_core::Tensor;

use crate::error::Result;
use crate::types::{
    CompletionSequenceGroupOutput, LogprobEntry, SampleRecord, SamplerOutput, SequenceMetadata,
    SpecDecodeWorkerMetrics, NO_TOKEN,
};

pub struct OutputAssembler {
    pub disable_logprobs: bool,
    pub max_logprobs: usize,
}

impl OutputAssembler {
    pub fn new(disable_logprobs: bool, max_logprobs: usize) -> Self {
        Self {
            disable_logprobs,
            max_logprobs,
        }
    }

    /// `accepted_token_ids` is `[B, k+1]` (i64), `target_logprobs` is
    /// `[B, k+1, V]` (f32, ignored when `disable_logprobs`), `prompt_logprobs`
    /// is one optional list per sequence.
    pub fn assemble(
        &self,
        seq_group_metadata: &[SequenceMetadata],
        accepted_token_ids: &Tensor,
        target_logprobs: Option<&Tensor>,
        prompt_logprobs: Option<&[Option<Vec<LogprobEntry>>]>,
        metrics: Option<SpecDecodeWorkerMetrics>,
    ) -> Result<Vec<SamplerOutput>> {
        let (batch_size, num_steps) = accepted_token_ids.dims2()?;
        let accepted_by_seq = accepted_token_ids.to_vec2::<i64>()?;
        // accepted_by_step[step][seq] for step-major iteration.
        let mut accepted_by_step = vec![vec![0i64; batch_size]; num_steps];
        for (seq, row) in accepted_by_seq.iter().enumerate() {
            for (step, &tok) in row.iter().enumerate() {
                accepted_by_step[step][seq] = tok;
            }
        }

        let logprobs_by_step: Option<Vec<Vec<Vec<f32>>>> = match target_logprobs {
            Some(t) if !self.disable_logprobs => Some(t.transpose(0, 1)?.to_vec3::<f32>()?),
            _ => None,
        };

        let mut outputs = Vec::new();

        // Prefill outputs: step 0 only, one per prompt sequence, in order.
        for (seq_idx, meta) in seq_group_metadata.iter().enumerate() {
            if !meta.is_prompt {
                break;
            }
            let plogs = prompt_logprobs.and_then(|p| p.get(seq_idx).cloned().flatten());
            let sample = if meta.do_sample {
                let token_id = accepted_by_seq[seq_idx][0];
                Some(self.sample_record(&logprobs_by_step, 0, seq_idx, token_id))
            } else {
                None
            };
            outputs.push(SamplerOutput {
                outputs: vec![CompletionSequenceGroupOutput {
                    seq_id: meta.seq_id,
                    sample,
                    prompt_logprobs: plogs,
                }],
                spec_decode_worker_metrics: None,
            });
        }

        // Decode outputs, one SamplerOutput per step, stopping at the first
        // step where every decode row is NO_TOKEN.
        for step in 0..num_steps {
            let all_pad = seq_group_metadata
                .iter()
                .enumerate()
                .filter(|(_, m)| !m.is_prompt)
                .all(|(seq_idx, _)| accepted_by_step[step][seq_idx] == NO_TOKEN);
            if all_pad {
                break;
            }

            let mut step_outputs = Vec::new();
            for (seq_idx, meta) in seq_group_metadata.iter().enumerate() {
                if meta.is_prompt {
                    continue;
                }
                let token_id = accepted_by_step[step][seq_idx];
                let sample = if token_id == NO_TOKEN {
                    Some(SampleRecord::padded(self.max_logprobs))
                } else {
                    Some(self.sample_record(&logprobs_by_step, step, seq_idx, token_id))
                };
                step_outputs.push(CompletionSequenceGroupOutput {
                    seq_id: meta.seq_id,
                    sample,
                    prompt_logprobs: None,
                });
            }
            outputs.push(SamplerOutput {
                outputs: step_outputs,
                spec_decode_worker_metrics: None,
            });
        }

        if let Some(m) = metrics {
            if let Some(first) = outputs.first_mut() {
                first.spec_decode_worker_metrics = Some(m);
            }
        }

        Ok(outputs)
    }

    fn sample_record(
        &self,
        logprobs_by_step: &Option<Vec<Vec<Vec<f32>>>>,
        step: usize,
        seq_idx: usize,
        token_id: i64,
    ) -> SampleRecord {
        match logprobs_by_step {
            Some(by_step) if token_id >= 0 => {
                let row = &by_step[step][seq_idx];
                let (rank, logprob) = rank_and_logprob(row, token_id as usize);
                let (topk_ids, topk_logprobs) = top_k(row, self.max_logprobs);
                SampleRecord {
                    token_id,
                    rank,
                    logprob,
                    top_k_token_ids: topk_ids,
                    top_k_logprobs: topk_logprobs,
                }
            }
            _ => SampleRecord {
                token_id,
                rank: -1,
                logprob: 0.0,
                top_k_token_ids: vec![NO_TOKEN; self.max_logprobs],
                top_k_logprobs: vec![f32::NEG_INFINITY; self.max_logprobs],
            },
        }
    }
}

/// 1-indexed rank of `token_id` within `row` by descending logprob, and its
/// logprob.
fn rank_and_logprob(row: &[f32], token_id: usize) -> (i64, f32) {
    let logprob = row[token_id];
    let rank = 1 + row.iter().filter(|&&p| p > logprob).count() as i64;
    (rank, logprob)
}

fn top_k(row: &[f32], k: usize) -> (Vec<i64>, Vec<f32>) {
    let mut indexed: Vec<(usize, f32)> = row.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed.truncate(k);
    let ids = indexed.iter().map(|&(i, _)| i as i64).collect();
    let logprobs = indexed.iter().map(|&(_, p)| p).collect();
    (ids, logprobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SamplingParams;
    use candle_core::Device;

    fn meta(seq_id: u64, is_prompt: bool, do_sample: bool) -> SequenceMetadata {
        SequenceMetadata {
            request_id: format!("r{seq_id}"),
            seq_id,
            is_prompt,
            do_sample,
            num_speculative_tokens: if is_prompt { 0 } else { 3 },
            token_chunk_size: 1,
            num_computed_tokens: 0,
            sampling_params: SamplingParams::default(),
        }
    }

    #[test]
    fn scenario_2_decode_rows_and_early_stop() {
        let device = Device::Cpu;
        let assembler = OutputAssembler::new(true, 0);
        let metas = vec![meta(1, false, true), meta(2, false, true)];
        // A = [t0,t1,-1,-1], B = [u0,u1,u2,u3]
        let accepted = Tensor::from_vec(
            vec![10i64, 11, -1, -1, 20, 21, 22, 23],
            (2, 4),
            &device,
        )
        .unwrap();
        let outputs = assembler
            .assemble(&metas, &accepted, None, None, None)
            .unwrap();
        // Stops before step index 2 would be fully padded for A but not B;
        // only when *every* decode row is -1 do we stop. Step indices 0..4
        // all have at least B's token, so all 4 steps are emitted.
        assert_eq!(outputs.len(), 4);
        assert_eq!(outputs[0].outputs.len(), 2);
        assert_eq!(outputs[2].outputs[0].sample.as_ref().unwrap().token_id, -1);
    }

    #[test]
    fn stops_at_first_all_pad_decode_step() {
        let device = Device::Cpu;
        let assembler = OutputAssembler::new(true, 0);
        let metas = vec![meta(1, false, true)];
        let accepted = Tensor::from_vec(vec![10i64, -1, -1, -1], (1, 4), &device).unwrap();
        let outputs = assembler
            .assemble(&metas, &accepted, None, None, None)
            .unwrap();
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn disable_logprobs_fills_sentinels_at_configured_length() {
        let device = Device::Cpu;
        let assembler = OutputAssembler::new(true, 5);
        let metas = vec![meta(1, false, true)];
        let accepted = Tensor::from_vec(vec![10i64], (1, 1), &device).unwrap();
        let outputs = assembler
            .assemble(&metas, &accepted, None, None, None)
            .unwrap();
        let sample = outputs[0].outputs[0].sample.as_ref().unwrap();
        assert_eq!(sample.rank, -1);
        assert_eq!(sample.logprob, 0.0);
        assert_eq!(sample.top_k_token_ids.len(), 5);
        assert_eq!(sample.top_k_logprobs.len(), 5);
    }

    #[test]
    fn prefill_output_appears_only_at_step_zero() {
        let device = Device::Cpu;
        let assembler = OutputAssembler::new(true, 0);
        let metas = vec![meta(1, true, true), meta(2, false, true)];
        let accepted = Tensor::from_vec(vec![7i64, -1, 99, 100], (2, 2), &device).unwrap();
        let outputs = assembler
            .assemble(&metas, &accepted, None, None, None)
            .unwrap();
        // outputs[0] = prefill record (just seq 1); outputs[1..] = decode steps (just seq 2)
        assert_eq!(outputs[0].outputs.len(), 1);
        assert_eq!(outputs[0].outputs[0].seq_id, 1);
        assert!(outputs[1..].iter().all(|o| o.outputs.len() == 1));
    }

    #[test]
    fn rank_and_logprob_matches_descending_position() {
        let row = vec![0.1, 0.9, 0.5, 0.2];
        assert_eq!(rank_and_logprob(&row, 1), (1, 0.9));
        assert_eq!(rank_and_logprob(&row, 2), (2, 0.5));
        assert_eq!(rank_and_logprob(&row, 0), (4, 0.1));
    }
}
