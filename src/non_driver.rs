//! Passive loop run by every non-driver rank (spec.md §4.H).
//!
//! Driven purely by the driver's broadcast; mirrors the proposer/scorer
//! call order so every rank arrives at the same collective points in the
//! same order (spec.md §5).

use crate::broadcast::RankTransport;
use crate::error::Result;
use crate::traits::{ProposerWorker, ScorerWorker};
use crate::types::ExecuteModelRequest;

pub struct NonDriverLoop<'a> {
    pub proposer: &'a mut dyn ProposerWorker,
    pub scorer: &'a mut dyn ScorerWorker,
    pub transport: &'a dyn RankTransport,
}

impl<'a> NonDriverLoop<'a> {
    pub fn new(
        proposer: &'a mut dyn ProposerWorker,
        scorer: &'a mut dyn ScorerWorker,
        transport: &'a dyn RankTransport,
    ) -> Self {
        Self {
            proposer,
            scorer,
            transport,
        }
    }

    /// Repeatedly calls [`Self::step`] until a shutdown broadcast arrives.
    pub async fn run(&mut self) -> Result<()> {
        while self.step().await? {}
        Ok(())
    }

    /// Returns `false` (and does nothing else) on an empty broadcast,
    /// `true` if it ran a step and the loop should continue.
    pub async fn step(&mut self) -> Result<bool> {
        let Some(control) = self.transport.recv()? else {
            return Ok(false);
        };

        // Every call below passes an empty, rank-local request: non-driver
        // ranks never see the driver's real `ExecuteModelRequest` (spec.md
        // §9 Open Questions), only the control dict and whatever the worker
        // reads from its own local KV-cache state.
        let request = ExecuteModelRequest {
            seq_group_metadata: Vec::new(),
            num_lookahead_slots: control.num_lookahead_slots,
            running_queue_size: 0,
            finished_requests_ids: Vec::new(),
            previous_hidden_states: None,
            spec_step_idx: 0,
        };

        if control.no_spec {
            self.scorer.execute_model(&request).await?;
        }

        if !control.disable_all_speculation {
            for _ in 0..control.num_lookahead_slots.max(1) {
                self.proposer.execute_model(&request).await?;
            }
        }

        if !control.no_spec {
            self.scorer.execute_model(&request).await?;
            if control.run_spec_proposer_for_prefill {
                self.proposer.execute_model(&request).await?;
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::{local_transport_group, ControlMessage};
    use crate::types::{ScorerExecutionOutput, SpeculativeProposals, SpeculativeScores};
    use candle_core::{DType, Device, Tensor};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProposer {
        execute_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ProposerWorker for CountingProposer {
        fn init_device(&mut self) -> Result<()> {
            Ok(())
        }
        fn load_model(&mut self) -> Result<()> {
            Ok(())
        }
        fn initialize_cache(&mut self, _: usize, _: usize) -> Result<()> {
            Ok(())
        }
        fn get_cache_block_size_bytes(&self) -> usize {
            0
        }
        fn vocab_size(&self) -> usize {
            32000
        }
        fn set_include_gpu_probs_tensor(&mut self) {}
        fn set_should_modify_greedy_probs_inplace(&mut self) {}
        async fn get_spec_proposals(
            &mut self,
            _request: &ExecuteModelRequest,
            _bonus_token_seqs: &crate::types::BonusTokenSet,
        ) -> Result<SpeculativeProposals> {
            let device = Device::Cpu;
            Ok(SpeculativeProposals {
                proposal_token_ids: Tensor::zeros((0, 0), DType::I64, &device).unwrap(),
                proposal_probs: Tensor::zeros((0, 0, 0), DType::F32, &device).unwrap(),
                proposal_lens: vec![],
                no_proposals: true,
            })
        }
        async fn execute_model(&mut self, _request: &ExecuteModelRequest) -> Result<()> {
            self.execute_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingScorer {
        execute_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ScorerWorker for CountingScorer {
        fn init_device(&mut self) -> Result<()> {
            Ok(())
        }
        fn load_model(&mut self) -> Result<()> {
            Ok(())
        }
        fn determine_num_available_blocks(&self) -> Result<(usize, usize)> {
            Ok((0, 0))
        }
        fn get_cache_block_size_bytes(&self) -> usize {
            0
        }
        fn initialize_cache(&mut self, _: usize, _: usize) -> Result<()> {
            Ok(())
        }
        fn vocab_size(&self) -> usize {
            32000
        }
        fn rank(&self) -> usize {
            1
        }
        fn device(&self) -> Device {
            Device::Cpu
        }
        async fn execute_model(
            &mut self,
            _request: &ExecuteModelRequest,
        ) -> Result<ScorerExecutionOutput> {
            self.execute_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ScorerExecutionOutput {
                sampler_output: Default::default(),
                hidden_states: None,
                prefill_hidden_states: None,
                sampled_token_ids: None,
            })
        }
        async fn score_proposals(
            &mut self,
            _request: &ExecuteModelRequest,
            _proposals: &SpeculativeProposals,
        ) -> Result<SpeculativeScores> {
            let device = Device::Cpu;
            Ok(SpeculativeScores {
                probs: Tensor::zeros((0, 0, 0), DType::F32, &device).unwrap(),
                token_ids: Tensor::zeros((0, 0), DType::I64, &device).unwrap(),
                logprobs: Tensor::zeros((0, 0, 0), DType::F32, &device).unwrap(),
                hidden_states: None,
                prompt_logprobs: None,
            })
        }
    }

    #[tokio::test]
    async fn scenario_7_shutdown_on_empty_broadcast() {
        let (driver, mut peers) = local_transport_group(1);
        driver.broadcast(None).unwrap();
        let mut proposer = CountingProposer {
            execute_calls: AtomicUsize::new(0),
        };
        let mut scorer = CountingScorer {
            execute_calls: AtomicUsize::new(0),
        };
        let peer = peers.remove(0);
        let mut loop_ = NonDriverLoop::new(&mut proposer, &mut scorer, &peer);
        let more = loop_.step().await.unwrap();
        assert!(!more);
    }

    #[tokio::test]
    async fn decode_step_calls_proposer_before_scorer_order_preserved() {
        let (driver, mut peers) = local_transport_group(1);
        driver
            .broadcast(Some(ControlMessage {
                num_lookahead_slots: 3,
                no_spec: false,
                disable_all_speculation: false,
                run_spec_proposer_for_prefill: false,
            }))
            .unwrap();
        let mut proposer = CountingProposer {
            execute_calls: AtomicUsize::new(0),
        };
        let mut scorer = CountingScorer {
            execute_calls: AtomicUsize::new(0),
        };
        let peer = peers.remove(0);
        let mut loop_ = NonDriverLoop::new(&mut proposer, &mut scorer, &peer);
        let more = loop_.step().await.unwrap();
        assert!(more);
        assert_eq!(proposer.execute_calls.load(Ordering::SeqCst), 3);
        assert_eq!(scorer.execute_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn prefill_step_runs_scorer_then_proposer_extra_call() {
        let (driver, mut peers) = local_transport_group(1);
        driver
            .broadcast(Some(ControlMessage {
                num_lookahead_slots: 0,
                no_spec: true,
                disable_all_speculation: false,
                run_spec_proposer_for_prefill: true,
            }))
            .unwrap();
        let mut proposer = CountingProposer {
            execute_calls: AtomicUsize::new(0),
        };
        let mut scorer = CountingScorer {
            execute_calls: AtomicUsize::new(0),
        };
        let peer = peers.remove(0);
        let mut loop_ = NonDriverLoop::new(&mut proposer, &mut scorer, &peer);
        loop_.step().await.unwrap();
        // no_spec branch: 1 scorer call, then 1 proposer catch-up call
        // (max(0,1)=1); run_spec_proposer_for_prefill only applies to the
        // `!no_spec` branch, so it does not fire here.
        assert_eq!(scorer.execute_calls.load(Ordering::SeqCst), 1);
        assert_eq!(proposer.execute_calls.load(Ordering::SeqCst), 1);
    }
}
