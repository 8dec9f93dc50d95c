//! Data model shared by every coordinator component (spec.md §3).

use std::collections::{HashMap, HashSet};

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Marks a position in a chunked prefill that does not predict a token.
/// Distinct from [`NO_TOKEN`]: this sentinel gates hidden-state selection,
/// `NO_TOKEN` gates accepted-token padding. Conflating the two is the single
/// most common correctness bug in this kind of coordinator (spec.md §9).
pub const INVALID_TOKEN_ID: i64 = -1_000_000_000;

/// Pad value for "no accepted token in this slot".
pub const NO_TOKEN: i64 = -1;

pub type SeqId = u64;
pub type RequestId = String;

/// Sampling parameters the coordinator itself reads. Temperature/top-k/top-p
/// etc. are owned by the (out of scope) sampler and never inspected here.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SamplingParams {
    pub seed: Option<u64>,
    pub prompt_logprobs: Option<usize>,
    pub max_logprobs: usize,
}

/// Per-sequence metadata for a single step (spec.md §3).
#[derive(Clone, Debug)]
pub struct SequenceMetadata {
    pub request_id: RequestId,
    pub seq_id: SeqId,
    pub is_prompt: bool,
    pub do_sample: bool,
    pub num_speculative_tokens: usize,
    pub token_chunk_size: usize,
    pub num_computed_tokens: usize,
    pub sampling_params: SamplingParams,
}

/// The second-to-last hidden state some proposers (e.g. Eagle) require, kept
/// as a parallel optional tensor alongside the primary one (spec.md §4.B).
#[derive(Clone, Debug)]
pub struct HiddenStates {
    pub hidden_states: Tensor,
    pub second_last_hidden_states: Option<Tensor>,
    pub seq_ids: Vec<SeqId>,
}

impl HiddenStates {
    pub fn new(hidden_states: Tensor, seq_ids: Vec<SeqId>) -> Self {
        Self {
            hidden_states,
            second_last_hidden_states: None,
            seq_ids,
        }
    }

    pub fn with_second_last(mut self, second_last: Tensor) -> Self {
        self.second_last_hidden_states = Some(second_last);
        self
    }
}

/// Per-step input to the coordinator (spec.md §3).
#[derive(Clone, Debug)]
pub struct ExecuteModelRequest {
    pub seq_group_metadata: Vec<SequenceMetadata>,
    pub num_lookahead_slots: usize,
    pub running_queue_size: usize,
    pub finished_requests_ids: Vec<RequestId>,
    pub previous_hidden_states: Option<HiddenStates>,
    /// Which MTP prefill layer this call corresponds to; only meaningful for
    /// draft models that require one prefill pass per layer.
    pub spec_step_idx: usize,
}

impl ExecuteModelRequest {
    /// A copy of this request restricted to the given sequences, the way the
    /// driver re-invokes the proposer on just the prefill sub-batch.
    pub fn restricted_to(&self, indices: &[usize]) -> Self {
        Self {
            seq_group_metadata: indices
                .iter()
                .map(|&i| self.seq_group_metadata[i].clone())
                .collect(),
            num_lookahead_slots: self.num_lookahead_slots,
            running_queue_size: self.running_queue_size,
            finished_requests_ids: self.finished_requests_ids.clone(),
            previous_hidden_states: self.previous_hidden_states.clone(),
            spec_step_idx: self.spec_step_idx,
        }
    }
}

/// Output of the proposer (spec.md §3).
#[derive(Clone, Debug)]
pub struct SpeculativeProposals {
    /// [B, k], -1 where no proposal.
    pub proposal_token_ids: Tensor,
    /// [B, k, V]
    pub proposal_probs: Tensor,
    /// [B], each entry is either 0 or k.
    pub proposal_lens: Vec<usize>,
    pub no_proposals: bool,
}

/// Output of the scorer (spec.md §3).
#[derive(Clone, Debug)]
pub struct SpeculativeScores {
    /// [B, k+1, V]
    pub probs: Tensor,
    /// [B, k+1]
    pub token_ids: Tensor,
    /// [B, k+1, V]
    pub logprobs: Tensor,
    /// [B, k+1, D]
    pub hidden_states: Option<Tensor>,
    pub prompt_logprobs: Option<Vec<Option<Vec<LogprobEntry>>>>,
}

#[derive(Clone, Debug)]
pub struct LogprobEntry {
    pub token_id: i64,
    pub rank: i64,
    pub logprob: f32,
}

impl LogprobEntry {
    /// A dummy entry for the `disable_logprobs` path (rank -1, logprob 0.0).
    pub fn dummy(token_id: i64) -> Self {
        Self {
            token_id,
            rank: -1,
            logprob: 0.0,
        }
    }
}

/// One sampled token plus its logprob bookkeeping (spec.md §6 `SamplerOutput`).
#[derive(Clone, Debug)]
pub struct SampleRecord {
    pub token_id: i64,
    pub rank: i64,
    pub logprob: f32,
    pub top_k_token_ids: Vec<i64>,
    pub top_k_logprobs: Vec<f32>,
}

impl SampleRecord {
    pub fn padded(num_logprobs: usize) -> Self {
        Self {
            token_id: NO_TOKEN,
            rank: 0,
            logprob: f32::NEG_INFINITY,
            top_k_token_ids: vec![NO_TOKEN; num_logprobs],
            top_k_logprobs: vec![f32::NEG_INFINITY; num_logprobs],
        }
    }
}

/// One sequence's output entry in a single per-step [`SamplerOutput`].
#[derive(Clone, Debug)]
pub struct CompletionSequenceGroupOutput {
    pub seq_id: SeqId,
    pub sample: Option<SampleRecord>,
    pub prompt_logprobs: Option<Vec<LogprobEntry>>,
}

/// Periodic rejection/typical-acceptance statistics (spec.md §6 `MetricsCollector`).
#[derive(Clone, Debug, Default)]
pub struct SpecDecodeWorkerMetrics {
    pub num_spec_tokens: usize,
    pub accepted_tokens: u64,
    pub draft_tokens: u64,
    pub emitted_tokens: u64,
}

/// One per-step record produced by [`crate::output_assembler::OutputAssembler`]
/// (spec.md §3/§6).
#[derive(Clone, Debug, Default)]
pub struct SamplerOutput {
    pub outputs: Vec<CompletionSequenceGroupOutput>,
    pub spec_decode_worker_metrics: Option<SpecDecodeWorkerMetrics>,
}

/// Raw result of a single scorer forward pass on the no-speculation path
/// (spec.md §4.G `_run_no_spec`). Distinct from [`SpeculativeScores`], which
/// is the speculative-step "score all k+1 candidates" output.
#[derive(Clone, Debug)]
pub struct ScorerExecutionOutput {
    /// Already-assembled per-sequence sample records; the scorer runs its
    /// own sampler when not in speculative mode.
    pub sampler_output: SamplerOutput,
    /// `[B, D]`, one row per `do_sample` sequence.
    pub hidden_states: Option<Tensor>,
    /// `[P, D]`, hidden states for the prefill sub-batch only, handed to the
    /// proposer to keep its KV-cache in sync.
    pub prefill_hidden_states: Option<Tensor>,
    /// `[B]`, aligned with `hidden_states`; used only to find
    /// non-predicting chunked-prefill slots (`== INVALID_TOKEN_ID`).
    pub sampled_token_ids: Option<Tensor>,
}

pub type BonusTokenSet = HashSet<SeqId>;
pub type RequestSeqIds = HashMap<RequestId, HashSet<SeqId>>;
