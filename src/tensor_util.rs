//! Small tensor-indexing helpers shared by [`crate::verifier`] and
//! [`crate::output_assembler`]. Kept separate so the control-flow-heavy
//! modules read as orchestration, not tensor plumbing.

use candle_core::{Device, Tensor};

use crate::error::Result;

/// Select rows `indices` from `t` along dim 0, preserving `indices`' order.
pub fn select_rows(t: &Tensor, indices: &[usize], device: &Device) -> Result<Tensor> {
    let idx: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
    let idx_tensor = Tensor::from_vec(idx, (indices.len(),), device)?;
    Ok(t.index_select(&idx_tensor, 0)?)
}

/// The permutation `inv` such that `inv[perm[i]] == i`, i.e. `t.index_select(inv, 0)`
/// puts the rows of a tensor whose row `i` belongs at output position
/// `perm[i]` back into `perm`'s order.
pub fn invert_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0usize; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inv[p] = i;
    }
    inv
}

/// Rolls the rows of `t` by one position (row `i` becomes row `i+1`, the
/// last row wraps to position 0), matching `Tensor.roll(shifts=1, dims=0)`.
/// Used to align the n-1th prefill hidden state with the nth input token
/// before handing prefill hidden states to the proposer.
pub fn roll_rows_by_one(t: &Tensor) -> Result<Tensor> {
    let n = t.dim(0)?;
    if n == 0 {
        return Ok(t.clone());
    }
    let last = t.narrow(0, n - 1, 1)?;
    let rest = t.narrow(0, 0, n - 1)?;
    Ok(Tensor::cat(&[&last, &rest], 0)?)
}

/// Reorders the rows of `t` (currently ordered as `original_order` describes,
/// i.e. row `i` of `t` belongs at output row `original_order[i]`) back into
/// natural order.
pub fn reorder_rows(t: &Tensor, original_order: &[usize], device: &Device) -> Result<Tensor> {
    let inv = invert_permutation(original_order);
    select_rows(t, &inv, device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invert_permutation_round_trips() {
        let perm = vec![2, 0, 1];
        let inv = invert_permutation(&perm);
        assert_eq!(inv, vec![1, 2, 0]);
        for i in 0..perm.len() {
            assert_eq!(inv[perm[i]], i);
        }
    }

    #[test]
    fn reorder_rows_restores_input_order() {
        let device = Device::Cpu;
        // rows currently in order [spec(idx 1), non_spec(idx 0)]
        let t = Tensor::from_vec(vec![10i64, 20], (2, 1), &device).unwrap();
        let original_order = vec![1, 0];
        let restored = reorder_rows(&t, &original_order, &device).unwrap();
        assert_eq!(restored.to_vec2::<i64>().unwrap(), vec![vec![20], vec![10]]);
    }

    #[test]
    fn roll_rows_by_one_wraps_last_to_front() {
        let device = Device::Cpu;
        let t = Tensor::from_vec(vec![1i64, 2, 3], (3, 1), &device).unwrap();
        let rolled = roll_rows_by_one(&t).unwrap();
        assert_eq!(
            rolled.to_vec2::<i64>().unwrap(),
            vec![vec![3], vec![1], vec![2]]
        );
    }
}
