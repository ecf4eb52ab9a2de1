//! Forward engine.

use candle_core::{DType, Tensor, D};

use super::{ensure_finite, masked_scores, pair_mask, rows_of, SavedState};
use crate::core::{AttentionError, AttentionShape, Config};
use crate::masks::{causal_offset, RowMask};
use crate::online::{BlockStats, RunningStats};
use crate::tiling::chunk_spans;

/// Computes attention chunk by chunk and returns the output together with the
/// statistics needed by [`backward`](super::backward).
///
/// The output has the shape and dtype of `q`; the saved statistics are `f32`.
pub fn forward(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&RowMask>,
    config: &Config,
) -> Result<(Tensor, SavedState), AttentionError> {
    config.validate()?;
    let shape = AttentionShape::from_qkv(q, k, v)?;
    if let Some(mask) = mask {
        mask.validate(&shape, q.device())?;
    }

    let dtype = q.dtype();
    let device = q.device();
    let AttentionShape {
        batch,
        num_heads,
        q_len,
        k_len,
        head_dim,
    } = shape;

    if q_len == 0 {
        let saved = SavedState {
            row_sum: Tensor::zeros(shape.stats_dims().as_slice(), DType::F32, device)?,
            row_max: Tensor::zeros(shape.stats_dims().as_slice(), DType::F32, device)?,
        };
        return Ok((q.zeros_like()?, saved));
    }

    let q = q.to_dtype(DType::F32)?;
    let k = k.to_dtype(DType::F32)?;
    let v = v.to_dtype(DType::F32)?;
    let scale = shape.scale();
    let offset = config.causal.then(|| causal_offset(q_len, k_len));

    let q_chunks = chunk_spans(q_len, config.q_chunk_size)?;
    log::debug!(
        "chunked forward: shape=[{batch}, {num_heads}, {q_len}/{k_len}, {head_dim}] q_chunks={} k_chunks={} causal={} masked={}",
        q_chunks.len(),
        chunk_spans(k_len, config.k_chunk_size)?.len(),
        config.causal,
        mask.is_some()
    );

    let mut outputs = Vec::with_capacity(q_chunks.len());
    let mut row_sums = Vec::with_capacity(q_chunks.len());
    let mut row_maxes = Vec::with_capacity(q_chunks.len());

    for q_span in q_chunks {
        let q_chunk = rows_of(&q, &q_span)?;
        let rows = mask
            .map(|mask| mask.rows(q_span.start, q_span.len))
            .transpose()?;
        let mut stats = RunningStats::new((batch, num_heads, q_span.len), head_dim, device)?;

        for k_span in chunk_spans(k_len, config.k_chunk_size)? {
            let k_chunk = rows_of(&k, &k_span)?;
            let v_chunk = rows_of(&v, &k_span)?;
            let chunk_mask = pair_mask(device, rows.as_ref(), &q_span, &k_span, offset)?;

            let scores = masked_scores(&q_chunk, &k_chunk, scale, chunk_mask.as_ref())?;
            let block_max = scores.max_keepdim(D::Minus1)?;
            let mut weights = scores.broadcast_sub(&block_max)?.exp()?;
            if let Some(chunk_mask) = &chunk_mask {
                weights = chunk_mask.zero_masked(&weights)?;
            }
            let block_sum = weights.sum_keepdim(D::Minus1)?.maximum(config.epsilon)?;
            let block_values = weights.matmul(&v_chunk)?;

            stats.absorb(&BlockStats {
                block_max,
                block_sum,
                block_values,
            })?;
        }

        let (output, row_sum, row_max) = stats.into_parts();
        ensure_finite("row_sum", &row_sum)?;
        ensure_finite("output", &output)?;
        outputs.push(output);
        row_sums.push(row_sum);
        row_maxes.push(row_max);
    }

    let output = Tensor::cat(&outputs, 2)?.to_dtype(dtype)?;
    let saved = SavedState {
        row_sum: Tensor::cat(&row_sums, 2)?,
        row_max: Tensor::cat(&row_maxes, 2)?,
    };
    Ok((output, saved))
}
