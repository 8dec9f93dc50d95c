//! Collaborator contracts consumed by the coordinator (spec.md §6).
//!
//! Implementations (n-gram lookup, a small draft model, Medusa,
//! MLP-speculator, Eagle, MTP, the target model, rejection/typical-acceptance
//! sampling) are out of scope here; the coordinator only ever calls through
//! these traits.

use candle_core::{DType, Device, Tensor};

use crate::error::Result;
use crate::types::{
    BonusTokenSet, ExecuteModelRequest, ScorerExecutionOutput, SpeculativeProposals,
    SpeculativeScores,
};

/// A worker that can produce speculative tokens for sequences.
#[async_trait::async_trait]
pub trait ProposerWorker: Send + Sync {
    fn init_device(&mut self) -> Result<()>;
    fn load_model(&mut self) -> Result<()>;
    fn initialize_cache(&mut self, num_gpu_blocks: usize, num_cpu_blocks: usize) -> Result<()>;
    fn get_cache_block_size_bytes(&self) -> usize;
    fn vocab_size(&self) -> usize;

    /// Configure the proposer's sampler to keep probability tensors on
    /// device, matching `_configure_model_sampler_for_spec_decode`.
    fn set_include_gpu_probs_tensor(&mut self);
    fn set_should_modify_greedy_probs_inplace(&mut self);

    /// Only meaningful for draft models that share the target's lm-head
    /// (e.g. Eagle); a no-op otherwise.
    fn maybe_load_lm_head_weight(&mut self, _weight: &Tensor) -> Result<()> {
        Ok(())
    }

    /// Produce top-1 linear proposals for every sequence in `request`,
    /// skipping a prefix for sequences in `bonus_token_seqs`.
    async fn get_spec_proposals(
        &mut self,
        request: &ExecuteModelRequest,
        bonus_token_seqs: &BonusTokenSet,
    ) -> Result<SpeculativeProposals>;

    /// Run the proposer forward pass with no sampling output expected
    /// (prefill-sync and non-speculative-decode calls).
    async fn execute_model(&mut self, request: &ExecuteModelRequest) -> Result<()>;
}

/// The target model: produces probabilities for all k+1 candidate positions.
#[async_trait::async_trait]
pub trait ScorerWorker: Send + Sync {
    fn init_device(&mut self) -> Result<()>;
    fn load_model(&mut self) -> Result<()>;
    fn determine_num_available_blocks(&self) -> Result<(usize, usize)>;
    fn get_cache_block_size_bytes(&self) -> usize;
    fn initialize_cache(&mut self, num_gpu_blocks: usize, num_cpu_blocks: usize) -> Result<()>;
    fn vocab_size(&self) -> usize;
    fn rank(&self) -> usize;
    fn device(&self) -> Device;

    /// Runs a non-speculative forward pass: the scorer samples for itself
    /// and reports the hidden states the coordinator needs to carry forward
    /// (spec.md §4.G `_run_no_spec`).
    async fn execute_model(&mut self, request: &ExecuteModelRequest) -> Result<ScorerExecutionOutput>;

    async fn score_proposals(
        &mut self,
        request: &ExecuteModelRequest,
        proposals: &SpeculativeProposals,
    ) -> Result<SpeculativeScores>;
}

/// Per-request deterministic RNG handle, used only by stochastic acceptance
/// samplers when a sequence's sampling params carry a seed.
pub type SeededSeqs = std::collections::HashMap<usize, u64>;

/// Rejection sampling or typical acceptance sampling (spec.md §6).
pub trait AcceptanceSampler: Send + Sync {
    /// `target_with_bonus_probs` [spec, k+1, V], `bonus_token_ids` [spec, 1],
    /// `draft_probs` [spec, k, V], `draft_token_ids` [spec, k]. Returns
    /// `accepted_token_ids` [spec, k+1].
    fn sample(
        &self,
        target_with_bonus_probs: &Tensor,
        bonus_token_ids: &Tensor,
        draft_probs: &Tensor,
        draft_token_ids: &Tensor,
        seeded_seqs: Option<&SeededSeqs>,
    ) -> Result<Tensor>;

    fn probs_dtype(&self) -> DType;
    fn token_id_dtype(&self) -> DType;

    /// Whether this sampler needs a per-request deterministic RNG
    /// (`seeded_seqs`) to reproduce a seeded sampling run exactly. Rejection
    /// sampling is stochastic; typical-acceptance sampling is not.
    fn is_stochastic(&self) -> bool;
}

/// Collects rejection/typical-acceptance statistics for periodic logging.
pub trait MetricsCollector: Send + Sync {
    fn init_tensors(&mut self, rank: usize, device: &Device);

    /// Returns `Some` only periodically (the rejection sampler emits
    /// aggregated metrics on an interval, not every step).
    fn maybe_collect_rejsample_metrics(
        &mut self,
        k: usize,
    ) -> Option<crate::types::SpecDecodeWorkerMetrics>;
}
