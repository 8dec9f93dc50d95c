//! Proposer/scorer/sampler selection rules (spec.md §4.J).
//!
//! Building the actual proposer/scorer/sampler implementations is out of
//! scope; this module only decides *which* one to build and how to
//! configure the coordinator around it, the way the original
//! `create_spec_worker`/`create_worker` do before handing off to concrete
//! constructors.

use crate::config::{AcceptanceMethod, DraftModelType, SpeculativeConfig};
use crate::error::{CoordinatorError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProposerKind {
    NGram,
    MlpSpeculator,
    Medusa,
    MultiStep,
}

/// The fully-resolved set of decisions the rest of the coordinator needs in
/// order to drive this configuration (spec.md §4.J).
#[derive(Clone, Copy, Debug)]
pub struct FactoryDecision {
    pub proposer_kind: ProposerKind,
    /// Forbids a step where the proposer returns zero draft tokens for
    /// every sequence. Only set for `MultiStep` with draft TP > 1.
    pub allow_zero_draft_token_step: bool,
    /// Whether the lifecycle manager should fetch and hand over the
    /// target's lm-head weight (Eagle-style draft models).
    pub load_lm_head_weight: bool,
    /// How many prefill forward passes the proposer needs per prefill step
    /// (`deepseek_mtp`'s `n_predict`, 1 otherwise).
    pub num_spec_prefill_steps: usize,
    /// Whether to wrap the proposer in a tensor-parallel-shrinking adapter
    /// because the draft runs at a smaller TP degree than the target.
    pub wrap_tp_shrinking_adapter: bool,
    /// `false` means batch-expansion scoring is used instead of MQA scoring.
    pub use_mqa_scorer: bool,
    pub acceptance_method: AcceptanceMethod,
}

/// `draft_model_type` is `DeepseekMtp`'s `n_predict`, looked up by the
/// caller from the draft model's own config; `None` when the draft type
/// isn't `DeepseekMtp`.
pub fn select(config: &SpeculativeConfig, deepseek_mtp_n_predict: Option<usize>) -> Result<FactoryDecision> {
    let proposer_kind;
    let mut load_lm_head_weight = false;
    let mut allow_zero_draft_token_step = true;
    let mut num_spec_prefill_steps = 1;

    if config.ngram_prompt_lookup_max > 0 {
        proposer_kind = ProposerKind::NGram;
    } else {
        match config.draft_model_type {
            Some(DraftModelType::MlpSpeculator) => proposer_kind = ProposerKind::MlpSpeculator,
            Some(DraftModelType::Medusa) => proposer_kind = ProposerKind::Medusa,
            Some(DraftModelType::Eagle) => {
                if config.draft_parallel_config.tensor_parallel_size > 1 {
                    return Err(CoordinatorError::Configuration(
                        "eagle draft models do not support tensor parallel size > 1".into(),
                    ));
                }
                proposer_kind = ProposerKind::MultiStep;
                load_lm_head_weight = true;
            }
            Some(DraftModelType::DeepseekMtp) => {
                proposer_kind = ProposerKind::MultiStep;
                num_spec_prefill_steps = deepseek_mtp_n_predict.ok_or_else(|| {
                    CoordinatorError::Configuration(
                        "deepseek_mtp draft models require n_predict to be known".into(),
                    )
                })?;
            }
            Some(DraftModelType::MultiStep) | None => {
                proposer_kind = ProposerKind::MultiStep;
            }
        }

        if proposer_kind == ProposerKind::MultiStep
            && config.draft_parallel_config.tensor_parallel_size > 1
        {
            allow_zero_draft_token_step = false;
        }
    }

    let wrap_tp_shrinking_adapter =
        config.draft_parallel_config.tensor_parallel_size < config.target_tensor_parallel_size;

    let use_mqa_scorer = !config.disable_mqa_scorer
        && config.scorer_attention_backend == "flash-attn"
        && config.draft_max_model_len >= config.target_max_model_len
        && config.target_enforce_eager;

    Ok(FactoryDecision {
        proposer_kind,
        allow_zero_draft_token_step,
        load_lm_head_weight,
        num_spec_prefill_steps,
        wrap_tp_shrinking_adapter,
        use_mqa_scorer,
        acceptance_method: config.acceptance_method,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DraftParallelConfig;

    fn base_config() -> SpeculativeConfig {
        SpeculativeConfig {
            scorer_attention_backend: "flash-attn".into(),
            target_enforce_eager: true,
            draft_max_model_len: 4096,
            target_max_model_len: 4096,
            ..SpeculativeConfig::default()
        }
    }

    #[test]
    fn ngram_takes_priority_over_draft_model_type() {
        let mut config = base_config();
        config.ngram_prompt_lookup_max = 4;
        config.draft_model_type = Some(DraftModelType::Medusa);
        let decision = select(&config, None).unwrap();
        assert_eq!(decision.proposer_kind, ProposerKind::NGram);
    }

    #[test]
    fn eagle_enables_lm_head_sharing_and_forbids_tp_greater_than_one() {
        let mut config = base_config();
        config.draft_model_type = Some(DraftModelType::Eagle);
        let decision = select(&config, None).unwrap();
        assert!(decision.load_lm_head_weight);
        assert_eq!(decision.proposer_kind, ProposerKind::MultiStep);

        config.draft_parallel_config = DraftParallelConfig {
            tensor_parallel_size: 2,
        };
        assert!(select(&config, None).is_err());
    }

    #[test]
    fn deepseek_mtp_sets_prefill_steps_from_n_predict() {
        let mut config = base_config();
        config.draft_model_type = Some(DraftModelType::DeepseekMtp);
        let decision = select(&config, Some(3)).unwrap();
        assert_eq!(decision.num_spec_prefill_steps, 3);
    }

    #[test]
    fn multi_step_with_tp_above_one_forbids_zero_draft_token_step() {
        let mut config = base_config();
        config.draft_parallel_config = DraftParallelConfig {
            tensor_parallel_size: 2,
        };
        let decision = select(&config, None).unwrap();
        assert!(!decision.allow_zero_draft_token_step);
    }

    #[test]
    fn mqa_scoring_disabled_when_attention_backend_is_not_flash_attn() {
        let mut config = base_config();
        config.scorer_attention_backend = "xformers".into();
        let decision = select(&config, None).unwrap();
        assert!(!decision.use_mqa_scorer);
    }

    #[test]
    fn mqa_scoring_disabled_in_non_eager_mode() {
        let mut config = base_config();
        config.target_enforce_eager = false;
        let decision = select(&config, None).unwrap();
        assert!(!decision.use_mqa_scorer);
    }

    #[test]
    fn tp_shrinking_adapter_applied_when_draft_tp_below_target_tp() {
        let mut config = base_config();
        config.draft_parallel_config = DraftParallelConfig {
            tensor_parallel_size: 1,
        };
        config.target_tensor_parallel_size = 4;
        let decision = select(&config, None).unwrap();
        assert!(decision.wrap_tp_shrinking_adapter);
    }
}
