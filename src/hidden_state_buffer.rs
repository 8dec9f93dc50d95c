//! Carries target hidden states from step N to step N+1, pruning finished
//! sequences (spec.md §4.B).

use std::collections::HashMap;

use candle_core::{Device, Tensor};

use crate::error::Result;
use crate::types::{HiddenStates, SeqId, SequenceMetadata};

#[derive(Clone)]
struct Entry {
    last: Vec<f32>,
    second_last: Option<Vec<f32>>,
}

/// Single-writer, single-owner mutable state held by the driver rank's
/// [`crate::step_driver::StepDriver`] (spec.md §5, §9).
#[derive(Default)]
pub struct HiddenStateBuffer {
    entries: HashMap<SeqId, Entry>,
    dim: usize,
}

impl HiddenStateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Adds or overwrites the entry for each sequence id in `meta_list`.
    /// `hidden` is `[B, D]`, row-aligned with `meta_list`.
    pub fn update(&mut self, hidden: &Tensor, meta_list: &[SequenceMetadata]) -> Result<()> {
        self.update_with_second_last(hidden, None, meta_list)
    }

    pub fn update_with_second_last(
        &mut self,
        hidden: &Tensor,
        second_last: Option<&Tensor>,
        meta_list: &[SequenceMetadata],
    ) -> Result<()> {
        let dims = hidden.dims2()?;
        self.dim = dims.1;
        for (row, meta) in meta_list.iter().enumerate() {
            let last = hidden.narrow(0, row, 1)?.flatten_all()?.to_vec1::<f32>()?;
            let second_last_row = match second_last {
                Some(t) => Some(t.narrow(0, row, 1)?.flatten_all()?.to_vec1::<f32>()?),
                None => None,
            };
            self.entries.insert(
                meta.seq_id,
                Entry {
                    last,
                    second_last: second_last_row,
                },
            );
        }
        Ok(())
    }

    /// Drops entries not present in `active_meta_list`.
    pub fn prune(&mut self, active_meta_list: &[SequenceMetadata]) {
        let active: std::collections::HashSet<SeqId> =
            active_meta_list.iter().map(|m| m.seq_id).collect();
        self.entries.retain(|seq_id, _| active.contains(seq_id));
    }

    /// Returns the current buffer as a batched [`HiddenStates`] and clears
    /// it. Row order follows `HashMap` iteration order, recorded in the
    /// returned `seq_ids` so callers can realign by sequence id.
    pub fn take(&mut self, device: &Device) -> Result<Option<HiddenStates>> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        let mut seq_ids = Vec::with_capacity(self.entries.len());
        let mut last_rows = Vec::with_capacity(self.entries.len());
        let mut second_last_rows: Vec<Vec<f32>> = Vec::with_capacity(self.entries.len());
        let mut has_second_last = true;
        for (seq_id, entry) in self.entries.drain() {
            seq_ids.push(seq_id);
            last_rows.extend_from_slice(&entry.last);
            match &entry.second_last {
                Some(row) => second_last_rows.extend_from_slice(row),
                None => has_second_last = false,
            }
        }
        let b = seq_ids.len();
        let hidden_states = Tensor::from_vec(last_rows, (b, self.dim), device)?;
        let second_last = if has_second_last {
            Some(Tensor::from_vec(second_last_rows, (b, self.dim), device)?)
        } else {
            None
        };
        Ok(Some(HiddenStates {
            hidden_states,
            second_last_hidden_states: second_last,
            seq_ids,
        }))
    }
}
