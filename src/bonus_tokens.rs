//! Remembers which sequence ids received a bonus token last step, so the
//! proposer can skip a prefix for them (spec.md §4.C).

use std::collections::HashMap;

use crate::types::{BonusTokenSet, RequestId, RequestSeqIds, SeqId};

/// Single-writer, single-owner mutable state held by the driver rank
/// (spec.md §5, §9).
#[derive(Default)]
pub struct BonusTokenTracker {
    seq_with_bonus_token: BonusTokenSet,
    request_seq_ids: RequestSeqIds,
}

impl BonusTokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bonus_set(&self) -> &BonusTokenSet {
        &self.seq_with_bonus_token
    }

    /// Step-start cleanup: drop every sequence id belonging to a request in
    /// `finished_requests_ids`. Idempotent against unknown ids (spec.md §7).
    pub fn drop_finished(&mut self, finished_requests_ids: &[RequestId]) {
        for request_id in finished_requests_ids {
            if let Some(seq_ids) = self.request_seq_ids.remove(request_id) {
                for seq_id in seq_ids {
                    self.seq_with_bonus_token.remove(&seq_id);
                }
            }
        }
    }

    /// Step-end update: membership for `seq_id` becomes `(last element of its
    /// accepted row != NO_TOKEN)`. `accepted_token_ids_by_step` is the
    /// per-step accepted-id matrix, `[num_steps][batch_size]`; the last step
    /// holds the bonus-token slot.
    pub fn update(
        &mut self,
        seq_ids: &[SeqId],
        request_seq_ids_this_step: &HashMap<RequestId, Vec<SeqId>>,
        accepted_token_ids_by_step: &[Vec<i64>],
    ) {
        let Some(last_step) = accepted_token_ids_by_step.last() else {
            return;
        };
        for (seq_index, &seq_id) in seq_ids.iter().enumerate() {
            let last_token_id = last_step[seq_index];
            if last_token_id == crate::types::NO_TOKEN {
                self.seq_with_bonus_token.remove(&seq_id);
            } else {
                self.seq_with_bonus_token.insert(seq_id);
            }
        }
        for (request_id, seq_ids) in request_seq_ids_this_step {
            self.request_seq_ids
                .entry(request_id.clone())
                .or_default()
                .extend(seq_ids.iter().copied());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_2_bonus_set_after_step() {
        let mut tracker = BonusTokenTracker::new();
        let seq_ids = vec![10, 20];
        let mut req_map = HashMap::new();
        req_map.insert("r1".to_string(), vec![10]);
        req_map.insert("r2".to_string(), vec![20]);
        // A: [t0,t1,-1,-1] -> bonus slot (last step) is -1.
        // B: [u0,u1,u2,u3] -> bonus slot is u3 (present).
        let by_step = vec![
            vec![0, 1],  // step0 accepted for both
            vec![1, 2],  // step1
            vec![-1, 3], // step2, A already terminated
            vec![-1, 4], // step3 (bonus slot)
        ];
        tracker.update(&seq_ids, &req_map, &by_step);
        assert!(!tracker.bonus_set().contains(&10));
        assert!(tracker.bonus_set().contains(&20));
    }

    #[test]
    fn finished_request_leaves_no_residue() {
        let mut tracker = BonusTokenTracker::new();
        let seq_ids = vec![10];
        let mut req_map = HashMap::new();
        req_map.insert("r1".to_string(), vec![10]);
        tracker.update(&seq_ids, &req_map, &[vec![5]]);
        assert!(tracker.bonus_set().contains(&10));
        tracker.drop_finished(&["r1".to_string()]);
        assert!(!tracker.bonus_set().contains(&10));
    }

    #[test]
    fn drop_finished_is_idempotent_against_unknown_ids() {
        let mut tracker = BonusTokenTracker::new();
        tracker.drop_finished(&["never-seen".to_string()]);
        tracker.drop_finished(&["never-seen".to_string()]);
    }
}
