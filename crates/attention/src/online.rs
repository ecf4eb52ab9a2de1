//! Online softmax accumulator.
//!
//! [`RunningStats`] carries, for every query row of a chunk, the running max
//! of the scaled scores seen so far, the running sum of `exp(score - max)`
//! and the accumulated (already normalised) output. Each key/value block is
//! folded in with [`RunningStats::absorb`]; whenever the running max grows the
//! previous sum and output are rescaled by `exp(old_max - new_max)`.
//!
//! Partial states computed over disjoint key ranges can be combined with
//! [`RunningStats::merge`]. The merge is associative and commutative, which
//! allows key ranges to be reduced in any grouping.

use candle_core::{DType, Device, Result, Tensor};

use crate::masks::MASKED_SCORE;

/// Statistics of a single key/value block for one query chunk.
#[derive(Debug, Clone)]
pub struct BlockStats {
    /// Row-wise max of the masked scores, `[.., rows, 1]`.
    pub block_max: Tensor,
    /// Row-wise sum of the masked `exp(score - block_max)`, floored at epsilon.
    pub block_sum: Tensor,
    /// Unnormalised `exp_weights · V`, `[.., rows, head_dim]`.
    pub block_values: Tensor,
}

/// Running `(max, sum, output)` triple for one query chunk.
#[derive(Debug, Clone)]
pub struct RunningStats {
    row_max: Tensor,
    row_sum: Tensor,
    output: Tensor,
}

impl RunningStats {
    /// Fresh state: `max = f32::MIN`, `sum = 0`, `output = 0`.
    ///
    /// `rows` is the leading shape `[batch, heads, chunk_rows]`.
    pub fn new(rows: (usize, usize, usize), head_dim: usize, device: &Device) -> Result<Self> {
        let (batch, heads, chunk_rows) = rows;
        Ok(Self {
            row_max: Tensor::full(MASKED_SCORE, (batch, heads, chunk_rows, 1), device)?,
            row_sum: Tensor::zeros((batch, heads, chunk_rows, 1), DType::F32, device)?,
            output: Tensor::zeros((batch, heads, chunk_rows, head_dim), DType::F32, device)?,
        })
    }

    /// Rebuilds a state from its parts, e.g. a partial result over a key range.
    pub fn from_parts(row_max: Tensor, row_sum: Tensor, output: Tensor) -> Self {
        Self {
            row_max,
            row_sum,
            output,
        }
    }

    pub fn row_max(&self) -> &Tensor {
        &self.row_max
    }

    pub fn row_sum(&self) -> &Tensor {
        &self.row_sum
    }

    pub fn output(&self) -> &Tensor {
        &self.output
    }

    /// Splits the state into `(output, row_sum, row_max)`.
    pub fn into_parts(self) -> (Tensor, Tensor, Tensor) {
        (self.output, self.row_sum, self.row_max)
    }

    /// Folds one key/value block into the running state.
    pub fn absorb(&mut self, block: &BlockStats) -> Result<()> {
        let new_max = block.block_max.maximum(&self.row_max)?;
        let alpha = (&self.row_max - &new_max)?.exp()?;
        let beta = (&block.block_max - &new_max)?.exp()?;
        let new_sum = ((&alpha * &self.row_sum)? + (&beta * &block.block_sum)?)?;

        let carry = ((&self.row_sum / &new_sum)? * &alpha)?;
        let fresh = (&beta / &new_sum)?;
        self.output = (self.output.broadcast_mul(&carry)?
            + block.block_values.broadcast_mul(&fresh)?)?;

        self.row_max = new_max;
        self.row_sum = new_sum;
        Ok(())
    }

    /// Combines two partial states computed over disjoint key ranges.
    pub fn merge(&self, other: &RunningStats) -> Result<RunningStats> {
        let new_max = self.row_max.maximum(&other.row_max)?;
        let lhs_scale = ((&self.row_max - &new_max)?.exp()? * &self.row_sum)?;
        let rhs_scale = ((&other.row_max - &new_max)?.exp()? * &other.row_sum)?;
        let new_sum = (&lhs_scale + &rhs_scale)?;
        // Two untouched states have a zero sum; their merged output stays zero.
        let denom = new_sum.maximum(f32::MIN_POSITIVE)?;

        let output = (self.output.broadcast_mul(&(&lhs_scale / &denom)?)?
            + other.output.broadcast_mul(&(&rhs_scale / &denom)?)?)?;

        Ok(RunningStats {
            row_max: new_max,
            row_sum: new_sum,
            output,
        })
    }
}
