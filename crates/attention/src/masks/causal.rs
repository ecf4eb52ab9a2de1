//! Causal policy evaluated per chunk pair.
//!
//! When `k_len > q_len`, queries are assumed to align with the most recent
//! `q_len` keys, so query `i` may attend keys `0..=i + (k_len - q_len)`.
//! Chunk pairs that lie entirely on or below the diagonal need no mask at all.

use candle_core::{Device, Result, Tensor};

use crate::tiling::ChunkSpan;

/// Alignment offset between query and key positions.
pub fn causal_offset(q_len: usize, k_len: usize) -> usize {
    k_len.saturating_sub(q_len)
}

/// Whether any key in `k` lies ahead of any aligned query in `q`.
pub fn needs_mask(q: &ChunkSpan, k: &ChunkSpan, offset: usize) -> bool {
    q.start + offset + 1 < k.end()
}

/// Builds the `[q.len, k.len]` keep grid for a straddling chunk pair.
///
/// Entry `(i, j)` is `1` when key `k.start + j` is at or before the aligned
/// query position `q.start + i + offset`.
pub fn keep_grid(device: &Device, q: &ChunkSpan, k: &ChunkSpan, offset: usize) -> Result<Tensor> {
    let mut data = vec![0u8; q.len * k.len];
    for i in 0..q.len {
        let max_k = q.start + i + offset;
        let row = &mut data[i * k.len..(i + 1) * k.len];
        for (j, keep) in row.iter_mut().enumerate() {
            if k.start + j <= max_k {
                *keep = 1;
            }
        }
    }
    Tensor::from_vec(data, (q.len, k.len), device)
}
