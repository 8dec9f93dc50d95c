//! Initialization and cache-sizing orchestration for the proposer/scorer
//! pair (spec.md §4.I).

use candle_core::Tensor;

use crate::block_splitter::split_blocks_evenly;
use crate::error::{CoordinatorError, Result};
use crate::traits::{ProposerWorker, ScorerWorker};

pub struct LifecycleManager<'a> {
    pub proposer: &'a mut dyn ProposerWorker,
    pub scorer: &'a mut dyn ScorerWorker,
}

impl<'a> LifecycleManager<'a> {
    pub fn new(proposer: &'a mut dyn ProposerWorker, scorer: &'a mut dyn ScorerWorker) -> Self {
        Self { proposer, scorer }
    }

    /// Scorer first (it may have a larger tensor-parallel degree and the
    /// draft must see a fully initialized target), then proposer. Returns
    /// the target's lm-head weight for callers that need to hand it to an
    /// Eagle-style draft model (spec.md §4.I, §4.J).
    pub fn init_device(&mut self) -> Result<()> {
        self.scorer.init_device()?;
        self.proposer.init_device()?;
        self.scorer.load_model()?;
        self.proposer.load_model()?;
        self.proposer.set_include_gpu_probs_tensor();
        self.proposer.set_should_modify_greedy_probs_inplace();
        self.verify_vocab_size()?;
        Ok(())
    }

    /// Hands the target's lm-head weight to the proposer. A no-op for every
    /// draft model type except ones that share the target's lm-head (e.g.
    /// Eagle); see [`ProposerWorker::maybe_load_lm_head_weight`].
    pub fn share_lm_head_weight(&mut self, target_lm_head_weight: &Tensor) -> Result<()> {
        self.proposer.maybe_load_lm_head_weight(target_lm_head_weight)
    }

    /// spec.md Invariant 6: proposer and scorer vocab sizes must agree.
    fn verify_vocab_size(&self) -> Result<()> {
        let proposer_vocab = self.proposer.vocab_size();
        let scorer_vocab = self.scorer.vocab_size();
        if proposer_vocab != scorer_vocab {
            return Err(CoordinatorError::Configuration(format!(
                "proposer vocab size {proposer_vocab} does not match scorer vocab size {scorer_vocab}"
            )));
        }
        Ok(())
    }

    /// Delegates to the scorer, then shrinks the GPU-block count by
    /// [`split_blocks_evenly`] (spec.md §4.A, §4.I).
    pub fn determine_num_available_blocks(&self) -> Result<(usize, usize)> {
        let (scorer_gpu_blocks, cpu_blocks) = self.scorer.determine_num_available_blocks()?;
        let scorer_block_bytes = self.scorer.get_cache_block_size_bytes();
        let proposer_block_bytes = self.proposer.get_cache_block_size_bytes();
        let gpu_blocks =
            split_blocks_evenly(scorer_block_bytes, proposer_block_bytes, scorer_gpu_blocks);
        Ok((gpu_blocks, cpu_blocks))
    }

    pub fn initialize_cache(&mut self, num_gpu_blocks: usize, num_cpu_blocks: usize) -> Result<()> {
        self.scorer.initialize_cache(num_gpu_blocks, num_cpu_blocks)?;
        self.proposer.initialize_cache(num_gpu_blocks, num_cpu_blocks)?;
        Ok(())
    }

    /// Nesting a speculative coordinator inside another is unsupported
    /// (spec.md §9 Non-goals / `NestedCoordinator`).
    pub fn get_cache_block_size_bytes(&self) -> Result<usize> {
        Err(CoordinatorError::NestedCoordinator)
    }
}
