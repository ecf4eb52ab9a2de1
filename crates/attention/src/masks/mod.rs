//! Mask utilities shared by attention implementations.
//!
//! Masks are `u8` keep-tensors: `1` where attention is permitted and `0`
//! otherwise. Two sources feed them:
//!
//! * a per-row validity mask ([`RowMask`]), where bit `[b, i]` governs the
//!   whole of query row `i` for batch element `b`;
//! * the implicit causal predicate ([`causal`]), evaluated lazily for the
//!   chunk pairs that straddle the diagonal.
//!
//! Scores at masked positions are replaced with [`MASKED_SCORE`] (the most
//! negative finite `f32`) before exponentiation so `exp` underflows to zero
//! without producing NaN or infinities.

pub mod causal;
pub mod padding;

use candle_core::{DType, Result, Tensor};

/// Dtype shared by all keep masks.
pub const MASK_DTYPE: DType = DType::U8;

/// Score written into masked positions.
pub const MASKED_SCORE: f32 = f32::MIN;

pub use causal::{causal_offset, keep_grid, needs_mask};
pub use padding::RowMask;

/// Combined keep mask for one (query chunk, key chunk) pair.
///
/// The tensor broadcasts against scores shaped `[batch, heads, q_rows, k_rows]`.
#[derive(Debug, Clone)]
pub struct ChunkMask {
    keep: Tensor,
}

impl ChunkMask {
    /// Merges the row-validity slice (`[batch, 1, q_rows, 1]`) with the causal
    /// grid (`[q_rows, k_rows]`). Returns `None` when neither applies.
    pub fn combine(rows: Option<&Tensor>, causal: Option<&Tensor>) -> Result<Option<Self>> {
        let keep = match (rows, causal) {
            (None, None) => return Ok(None),
            (Some(rows), None) => rows.clone(),
            (None, Some(grid)) => grid.clone(),
            (Some(rows), Some(grid)) => rows.broadcast_mul(grid)?,
        };
        Ok(Some(Self { keep }))
    }

    /// Raw keep tensor.
    pub fn keep(&self) -> &Tensor {
        &self.keep
    }

    /// Forces masked scores to [`MASKED_SCORE`].
    pub fn fill_scores(&self, scores: &Tensor) -> Result<Tensor> {
        let fill = Tensor::full(MASKED_SCORE, scores.dims(), scores.device())?;
        self.keep
            .broadcast_as(scores.dims())?
            .where_cond(scores, &fill)
    }

    /// Zeroes weights at masked positions.
    pub fn zero_masked(&self, weights: &Tensor) -> Result<Tensor> {
        let zeros = weights.zeros_like()?;
        self.keep
            .broadcast_as(weights.dims())?
            .where_cond(weights, &zeros)
    }
}
