//! Top-level per-step state machine (spec.md §4.G).
//!
//! Control flow per step on the driver: decide no-spec vs. spec, broadcast
//! control to peer ranks, then orchestrate proposer/scorer/verifier.

use candle_core::Device;

use crate::batch_partition::{partition_by_proposal_len, prefill_only};
use crate::bonus_tokens::BonusTokenTracker;
use crate::broadcast::{ControlMessage, RankTransport};
use crate::error::{CoordinatorError, Result};
use crate::hidden_state_buffer::HiddenStateBuffer;
use crate::metrics::{maybe_log_stage_times, StageTimes, Timer};
use crate::output_assembler::OutputAssembler;
use crate::tensor_util::{roll_rows_by_one, select_rows};
use crate::traits::{AcceptanceSampler, MetricsCollector, ProposerWorker, ScorerWorker};
use crate::types::{ExecuteModelRequest, HiddenStates, SamplerOutput, INVALID_TOKEN_ID};
use crate::verifier::{request_seq_ids_this_step, Verifier};

/// Owns the single-writer mutable state (`HiddenStateBuffer`,
/// `BonusTokenTracker`) and drives one step at a time (spec.md §5, §9).
pub struct StepDriver<'a> {
    pub proposer: &'a mut dyn ProposerWorker,
    pub scorer: &'a mut dyn ScorerWorker,
    pub sampler: &'a dyn AcceptanceSampler,
    pub transport: &'a dyn RankTransport,
    pub metrics: Option<&'a mut dyn MetricsCollector>,
    pub device: Device,

    pub disable_by_batch_size: Option<usize>,
    pub allow_zero_draft_token_step: bool,
    pub disable_logprobs: bool,
    pub disable_log_stats: bool,
    pub max_logprobs: usize,
    pub num_spec_prefill_steps: usize,

    bonus_tracker: BonusTokenTracker,
    hidden_buffer: HiddenStateBuffer,
}

impl<'a> StepDriver<'a> {
    pub fn new(
        proposer: &'a mut dyn ProposerWorker,
        scorer: &'a mut dyn ScorerWorker,
        sampler: &'a dyn AcceptanceSampler,
        transport: &'a dyn RankTransport,
        device: Device,
    ) -> Self {
        Self {
            proposer,
            scorer,
            sampler,
            transport,
            metrics: None,
            device,
            disable_by_batch_size: None,
            allow_zero_draft_token_step: true,
            disable_logprobs: false,
            disable_log_stats: false,
            max_logprobs: 5,
            num_spec_prefill_steps: 1,
            bonus_tracker: BonusTokenTracker::new(),
            hidden_buffer: HiddenStateBuffer::new(),
        }
    }

    pub async fn step(&mut self, mut request: ExecuteModelRequest) -> Result<Vec<SamplerOutput>> {
        self.bonus_tracker.drop_finished(&request.finished_requests_ids);

        let metas = &request.seq_group_metadata;
        let all_prompt = !metas.is_empty() && metas.iter().all(|m| m.is_prompt);
        let atleast_one_prompt = metas.iter().any(|m| m.is_prompt);
        let all_zero_spec = metas.iter().all(|m| m.num_speculative_tokens == 0);
        let disable_all_speculation = match self.disable_by_batch_size {
            Some(limit) => request.running_queue_size >= limit,
            None => false,
        };
        let no_spec = request.num_lookahead_slots == 0 || disable_all_speculation || all_zero_spec;

        if all_prompt && request.num_lookahead_slots != 0 {
            return Err(CoordinatorError::InvariantViolation(
                "prompt-only batches must schedule zero lookahead slots".into(),
            ));
        }

        if disable_all_speculation {
            tracing::warn!(
                running_queue_size = request.running_queue_size,
                limit = self.disable_by_batch_size,
                "running queue size tripped disable_by_batch_size; forcing no-spec for this step"
            );
            for meta in request.seq_group_metadata.iter_mut() {
                meta.num_speculative_tokens = 0;
            }
        }

        tracing::debug!(
            no_spec,
            all_prompt,
            atleast_one_prompt,
            all_zero_spec,
            disable_all_speculation,
            num_lookahead_slots = request.num_lookahead_slots,
            "step_driver: resolved no_spec vs. speculative transition"
        );

        self.transport.broadcast(Some(ControlMessage {
            num_lookahead_slots: request.num_lookahead_slots,
            no_spec,
            disable_all_speculation,
            run_spec_proposer_for_prefill: atleast_one_prompt,
        }))?;

        if no_spec {
            self.run_no_spec(request, disable_all_speculation).await
        } else {
            self.run_speculative_decoding_step(request).await
        }
    }

    /// spec.md §4.G `_run_no_spec`.
    async fn run_no_spec(
        &mut self,
        mut request: ExecuteModelRequest,
        skip_proposer: bool,
    ) -> Result<Vec<SamplerOutput>> {
        let exec = self.scorer.execute_model(&request).await?;

        if let Some(hidden) = &exec.hidden_states {
            let terminal: Vec<_> = request
                .seq_group_metadata
                .iter()
                .filter(|m| m.do_sample)
                .cloned()
                .collect();
            if !terminal.is_empty() {
                let mut hidden = hidden.clone();
                if terminal.iter().any(|m| m.is_prompt) {
                    if let Some(sampled) = &exec.sampled_token_ids {
                        let ids = sampled.flatten_all()?.to_vec1::<i64>()?;
                        let keep: Vec<usize> = ids
                            .iter()
                            .enumerate()
                            .filter(|&(_, &v)| v != INVALID_TOKEN_ID)
                            .map(|(i, _)| i)
                            .collect();
                        hidden = select_rows(&hidden, &keep, &self.device)?;
                    }
                }
                self.hidden_buffer.update(&hidden, &terminal)?;
                self.hidden_buffer.prune(&terminal);
            }
        }

        if !skip_proposer {
            if let Some(prefill_hidden) = &exec.prefill_hidden_states {
                let rolled = roll_rows_by_one(prefill_hidden)?;
                request.previous_hidden_states = Some(HiddenStates::new(rolled, vec![]));
            }
            for i in 0..self.num_spec_prefill_steps {
                request.spec_step_idx = i;
                self.proposer.execute_model(&request).await?;
            }
        }

        let output = if self.disable_logprobs {
            serialize_no_logprobs(exec.sampler_output)
        } else {
            exec.sampler_output
        };

        Ok(vec![output])
    }

    /// spec.md §4.G `_run_speculative_decoding_step`.
    async fn run_speculative_decoding_step(
        &mut self,
        mut request: ExecuteModelRequest,
    ) -> Result<Vec<SamplerOutput>> {
        request.previous_hidden_states = self.hidden_buffer.take(&self.device)?;
        let bonus_set = self.bonus_tracker.bonus_set().clone();

        let proposal_timer = Timer::start();
        let proposals = self
            .proposer
            .get_spec_proposals(&request, &bonus_set)
            .await?;
        let proposal_time_ms = proposal_timer.elapsed_ms();

        if !self.allow_zero_draft_token_step && proposals.no_proposals {
            tracing::warn!("proposer returned zero draft tokens for every sequence; failing step");
            return Err(CoordinatorError::ZeroProposals);
        }

        request.previous_hidden_states = None;

        let scoring_timer = Timer::start();
        let proposal_scores = self.scorer.score_proposals(&request, &proposals).await?;
        let scoring_time_ms = scoring_timer.elapsed_ms();

        let partition = partition_by_proposal_len(&proposals.proposal_lens);
        let non_spec_prefill_indices =
            prefill_only(&partition.non_spec_indices, &request.seq_group_metadata);
        if !non_spec_prefill_indices.is_empty() {
            if let Some(hidden) = &proposal_scores.hidden_states {
                let prefill_hidden = select_rows(hidden, &non_spec_prefill_indices, &self.device)?;
                let rolled = roll_rows_by_one(&prefill_hidden)?;
                request.previous_hidden_states = Some(HiddenStates::new(rolled, vec![]));
            }
            let prefill_req = request.restricted_to(&non_spec_prefill_indices);
            self.proposer.execute_model(&prefill_req).await?;
        }

        let verifier = Verifier::new(self.sampler, self.device.clone());
        let verification_timer = Timer::start();
        let verify_out = verifier.verify_tokens(
            &request.seq_group_metadata,
            &proposal_scores,
            &proposals,
            request.num_lookahead_slots,
            &mut self.hidden_buffer,
        )?;
        let verification_time_ms = verification_timer.elapsed_ms();

        maybe_log_stage_times(
            self.disable_log_stats,
            StageTimes {
                proposal_time_ms: proposal_time_ms / request.num_lookahead_slots.max(1) as f64,
                scoring_time_ms,
                verification_time_ms,
            },
        );

        let assembler = OutputAssembler::new(self.disable_logprobs, self.max_logprobs);
        let metrics = self
            .metrics
            .as_mut()
            .and_then(|m| m.maybe_collect_rejsample_metrics(request.num_lookahead_slots));
        let prompt_logprobs = if self.disable_logprobs {
            None
        } else {
            proposal_scores.prompt_logprobs.as_deref()
        };
        let outputs = assembler.assemble(
            &request.seq_group_metadata,
            &verify_out.accepted_token_ids,
            Some(&verify_out.target_logprobs),
            prompt_logprobs,
            metrics,
        )?;

        let seq_ids: Vec<_> = request
            .seq_group_metadata
            .iter()
            .map(|m| m.seq_id)
            .collect();
        let req_seq_ids_this_step = request_seq_ids_this_step(&request.seq_group_metadata);
        let accepted_rows = verify_out.accepted_token_ids.to_vec2::<i64>()?;
        let num_steps = accepted_rows.first().map(|r| r.len()).unwrap_or(0);
        let mut accepted_by_step = vec![vec![0i64; accepted_rows.len()]; num_steps];
        for (seq_idx, row) in accepted_rows.iter().enumerate() {
            for (step, &tok) in row.iter().enumerate() {
                accepted_by_step[step][seq_idx] = tok;
            }
        }
        self.bonus_tracker
            .update(&seq_ids, &req_seq_ids_this_step, &accepted_by_step);

        Ok(outputs)
    }
}

/// spec.md §4.G `_run_no_spec` token-only path: strips logprob bookkeeping
/// and drops entries for non-predicting chunked-prefill slots.
fn serialize_no_logprobs(mut sampler_output: SamplerOutput) -> SamplerOutput {
    for output in sampler_output.outputs.iter_mut() {
        if let Some(sample) = &mut output.sample {
            if sample.token_id == INVALID_TOKEN_ID {
                output.sample = None;
            } else {
                sample.rank = -1;
                sample.logprob = 0.0;
                sample.top_k_token_ids.clear();
                sample.top_k_logprobs.clear();
            }
        }
    }
    sampler_output
}
