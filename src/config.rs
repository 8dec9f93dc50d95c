//! Coordinator configuration, consumed by [`crate::factory::Factory`]
//! (spec.md §4.J, §6).

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, Result};

/// Which draft model family the proposer wraps. Drives the selection rules
/// in §4.J.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftModelType {
    MultiStep,
    MlpSpeculator,
    Medusa,
    Eagle,
    DeepseekMtp,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum AcceptanceMethod {
    RejectionSampler,
    TypicalAcceptanceSampler {
        posterior_threshold: f64,
        posterior_alpha: f64,
    },
}

impl Default for AcceptanceMethod {
    fn default() -> Self {
        AcceptanceMethod::RejectionSampler
    }
}

/// Draft (proposer-side) tensor-parallel configuration.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DraftParallelConfig {
    pub tensor_parallel_size: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpeculativeConfig {
    pub num_speculative_tokens: usize,
    pub draft_model_type: Option<DraftModelType>,
    pub draft_parallel_config: DraftParallelConfig,
    pub target_tensor_parallel_size: usize,

    pub disable_mqa_scorer: bool,
    pub disable_by_batch_size: Option<usize>,
    pub acceptance_method: AcceptanceMethod,
    pub disable_logprobs: bool,
    pub disable_log_stats: bool,

    /// > 0 selects the n-gram proposer regardless of `draft_model_type`.
    pub ngram_prompt_lookup_min: usize,
    pub ngram_prompt_lookup_max: usize,

    /// Attention backend name reported by the scorer; only `"flash-attn"`
    /// supports MQA scoring.
    pub scorer_attention_backend: String,
    pub draft_max_model_len: usize,
    pub target_max_model_len: usize,
    /// `false` means the target runs in a graph-compiled mode, which
    /// disqualifies MQA scoring (§4.J).
    pub target_enforce_eager: bool,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            num_speculative_tokens: 0,
            draft_model_type: None,
            draft_parallel_config: DraftParallelConfig {
                tensor_parallel_size: 1,
            },
            target_tensor_parallel_size: 1,
            disable_mqa_scorer: false,
            disable_by_batch_size: None,
            acceptance_method: AcceptanceMethod::default(),
            disable_logprobs: false,
            disable_log_stats: false,
            ngram_prompt_lookup_min: 0,
            ngram_prompt_lookup_max: 0,
            scorer_attention_backend: String::new(),
            draft_max_model_len: usize::MAX,
            target_max_model_len: usize::MAX,
            target_enforce_eager: true,
        }
    }
}

impl SpeculativeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| CoordinatorError::Configuration(e.to_string()))
    }

    /// spec.md §1 Non-goals: pipeline parallelism can never be combined with
    /// speculative decoding.
    pub fn validate(&self, pipeline_parallel_size: usize) -> Result<()> {
        if pipeline_parallel_size > 1 {
            return Err(CoordinatorError::Configuration(
                "speculative decoding is incompatible with pipeline parallelism".into(),
            ));
        }
        if self.draft_model_type == Some(DraftModelType::Eagle)
            && self.draft_parallel_config.tensor_parallel_size > 1
        {
            return Err(CoordinatorError::Configuration(
                "eagle draft models do not support tensor parallel size > 1".into(),
            ));
        }
        Ok(())
    }
}
