//! Coordinator for speculative decoding in a tensor-parallel LLM inference
//! engine.
//!
//! This crate owns the batch bookkeeping and control flow around
//! speculative decoding — deciding when to speculate, driving the
//! proposer/scorer/verifier sequence, keeping non-driver ranks in lock
//! step, and assembling per-step outputs. The proposer, scorer, and
//! acceptance sampler themselves are out of scope: callers implement
//! [`traits::ProposerWorker`], [`traits::ScorerWorker`], and
//! [`traits::AcceptanceSampler`] and hand them to [`step_driver::StepDriver`].

pub mod batch_partition;
pub mod block_splitter;
pub mod bonus_tokens;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod factory;
pub mod hidden_state_buffer;
pub mod lifecycle;
pub mod metrics;
pub mod non_driver;
pub mod output_assembler;
pub mod step_driver;
pub mod tensor_util;
pub mod traits;
pub mod types;
pub mod verifier;

pub use error::{CoordinatorError, Result};
pub use step_driver::StepDriver;
pub use types::{ExecuteModelRequest, SamplerOutput};

/// Initializes a `tracing` subscriber reading `RUST_LOG` (or `info` by
/// default), the way a binary embedding this crate would wire up logging
/// before running any steps.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();
}
