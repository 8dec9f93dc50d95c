//! Divides a fixed KV budget between proposer and scorer so both hold equal
//! block counts (spec.md §4.A).

/// Given the scorer's and proposer's per-block byte sizes and the total
/// block count computed for the scorer alone, return the block count both
/// models should use.
///
/// `new_gpu_blocks = floor(total_blocks * scorer_bytes / (scorer_bytes + proposer_bytes))`.
/// This bounds total KV memory by the scorer's original budget while
/// keeping both caches the same length in blocks, which is required
/// because they index by the same logical position.
pub fn split_blocks_evenly(
    scorer_block_bytes: usize,
    proposer_block_bytes: usize,
    total_blocks: usize,
) -> usize {
    (total_blocks as u128 * scorer_block_bytes as u128
        / (scorer_block_bytes as u128 + proposer_block_bytes as u128)) as usize
}
