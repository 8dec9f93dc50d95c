use thiserror::Error;

/// Error taxonomy for the speculative decoding coordinator (spec.md §7).
///
/// `Configuration` and `InvariantViolation` are both fatal: a step that hits
/// either aborts without retry, matching the upstream policy that the
/// coordinator never retries a failed step.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("speculative decoding configuration error: {0}")]
    Configuration(String),

    #[error("speculative decoding invariant violated: {0}")]
    InvariantViolation(String),

    #[error("proposer produced no proposals but the coordinator forbids zero-draft-token steps")]
    ZeroProposals,

    #[error("nesting a speculative coordinator inside another is not supported")]
    NestedCoordinator,

    #[error(transparent)]
    Worker(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
