//! Stage-time instrumentation and the default rejection-sampling metrics
//! collector (spec.md §6 `MetricsCollector`, §9 `_maybe_log_stage_times`).

use std::time::Instant;

use crate::types::SpecDecodeWorkerMetrics;

/// RAII stopwatch, mirroring the original's `Timer() as proposal_timer`
/// context manager.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

/// Per-step elapsed time for the three collective stages, already
/// normalized the way the original divides proposal time by the lookahead
/// width.
#[derive(Clone, Copy, Debug)]
pub struct StageTimes {
    pub proposal_time_ms: f64,
    pub scoring_time_ms: f64,
    pub verification_time_ms: f64,
}

/// Logs `stage_times` at info level unless stats logging is disabled
/// (spec.md §9 `_maybe_log_stage_times`, gated on `disable_log_stats`).
pub fn maybe_log_stage_times(disable_log_stats: bool, stage_times: StageTimes) {
    if disable_log_stats {
        return;
    }
    tracing::info!(
        proposal_time_ms = stage_times.proposal_time_ms,
        scoring_time_ms = stage_times.scoring_time_ms,
        verification_time_ms = stage_times.verification_time_ms,
        "speculative decoding step timings"
    );
}

/// Accumulates accepted/draft/emitted token counts and reports an
/// aggregate [`SpecDecodeWorkerMetrics`] every `collection_interval` calls,
/// the way the upstream rejection sampler throttles metric emission.
pub struct RollingMetricsCollector {
    collection_interval: u64,
    calls_since_last_collection: u64,
    accepted_tokens: u64,
    draft_tokens: u64,
    emitted_tokens: u64,
}

impl RollingMetricsCollector {
    pub fn new(collection_interval: u64) -> Self {
        Self {
            collection_interval: collection_interval.max(1),
            calls_since_last_collection: 0,
            accepted_tokens: 0,
            draft_tokens: 0,
            emitted_tokens: 0,
        }
    }

    pub fn observe(&mut self, accepted: u64, draft: u64, emitted: u64) {
        self.accepted_tokens += accepted;
        self.draft_tokens += draft;
        self.emitted_tokens += emitted;
        self.calls_since_last_collection += 1;
    }
}

impl crate::traits::MetricsCollector for RollingMetricsCollector {
    fn init_tensors(&mut self, _rank: usize, _device: &candle_core::Device) {}

    fn maybe_collect_rejsample_metrics(&mut self, k: usize) -> Option<SpecDecodeWorkerMetrics> {
        if self.calls_since_last_collection < self.collection_interval {
            return None;
        }
        self.calls_since_last_collection = 0;
        Some(SpecDecodeWorkerMetrics {
            num_spec_tokens: k,
            accepted_tokens: self.accepted_tokens,
            draft_tokens: self.draft_tokens,
            emitted_tokens: self.emitted_tokens,
        })
    }
}
