//! Backward engine.
//!
//! Attention weights are rebuilt per chunk pair as
//! `p = exp(scores - row_max) / row_sum` from the statistics saved by the
//! forward pass. With `D = rowsum(dO ⊙ O)` the gradients are
//!
//! ```text
//! dV += pᵀ · dO
//! dS  = p ⊙ scale ⊙ (dO · Vᵀ - D)
//! dQ += dS · K
//! dK += dSᵀ · Q
//! ```
//!
//! `dQ` accumulates across key chunks for a fixed query chunk, `dK`/`dV`
//! across query chunks for a fixed key chunk. Each accumulator is
//! zero-initialised once per call.

use candle_core::{DType, Tensor, D};

use super::{
    ensure_finite, ensure_query_shaped, masked_scores, pair_mask, rows_of, SavedState,
};
use crate::core::{AttentionError, AttentionShape, Config};
use crate::masks::{causal_offset, RowMask};
use crate::tiling::chunk_spans;

/// Gradients with respect to the three attention inputs.
///
/// Each gradient has the shape and dtype of its input.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub dq: Tensor,
    pub dk: Tensor,
    pub dv: Tensor,
}

/// Recomputes attention chunk by chunk and returns `dQ`, `dK`, `dV`.
///
/// `mask` and `config` must be the ones given to the forward pass that produced
/// `output` and `saved`.
#[allow(clippy::too_many_arguments)]
pub fn backward(
    d_output: &Tensor,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    output: &Tensor,
    saved: &SavedState,
    mask: Option<&RowMask>,
    config: &Config,
) -> Result<Gradients, AttentionError> {
    config.validate()?;
    let shape = AttentionShape::from_qkv(q, k, v)?;
    if let Some(mask) = mask {
        mask.validate(&shape, q.device())?;
    }
    ensure_query_shaped("d_output", d_output, &shape)?;
    ensure_query_shaped("output", output, &shape)?;
    saved.ensure_matches(&shape)?;

    let AttentionShape {
        batch,
        num_heads,
        q_len,
        k_len,
        head_dim,
    } = shape;

    if q_len == 0 || k_len == 0 {
        return Ok(Gradients {
            dq: q.zeros_like()?,
            dk: k.zeros_like()?,
            dv: v.zeros_like()?,
        });
    }

    let device = q.device();
    let q32 = q.to_dtype(DType::F32)?;
    let k32 = k.to_dtype(DType::F32)?;
    let v32 = v.to_dtype(DType::F32)?;
    let out32 = output.to_dtype(DType::F32)?;
    let d_out32 = d_output.to_dtype(DType::F32)?;
    let row_sum = saved.row_sum.to_dtype(DType::F32)?;
    let row_max = saved.row_max.to_dtype(DType::F32)?;
    let scale = shape.scale();
    let offset = config.causal.then(|| causal_offset(q_len, k_len));

    let q_chunks = chunk_spans(q_len, config.q_chunk_size)?;
    let k_chunks = chunk_spans(k_len, config.k_chunk_size)?;
    log::debug!(
        "chunked backward: shape=[{batch}, {num_heads}, {q_len}/{k_len}, {head_dim}] q_chunks={} k_chunks={}",
        q_chunks.len(),
        k_chunks.len()
    );

    let mut dk_parts = Vec::with_capacity(k_chunks.len());
    let mut dv_parts = Vec::with_capacity(k_chunks.len());
    for k_span in k_chunks.clone() {
        let zeros = Tensor::zeros((batch, num_heads, k_span.len, head_dim), DType::F32, device)?;
        dk_parts.push(zeros.clone());
        dv_parts.push(zeros);
    }
    let mut dq_parts = Vec::with_capacity(q_chunks.len());

    for q_span in q_chunks {
        let q_chunk = rows_of(&q32, &q_span)?;
        let out_chunk = rows_of(&out32, &q_span)?;
        let d_out_chunk = rows_of(&d_out32, &q_span)?;
        let sum_chunk = rows_of(&row_sum, &q_span)?;
        let max_chunk = rows_of(&row_max, &q_span)?;
        let rows = mask
            .map(|mask| mask.rows(q_span.start, q_span.len))
            .transpose()?;

        let delta = (&d_out_chunk * &out_chunk)?.sum_keepdim(D::Minus1)?;
        let mut dq_chunk =
            Tensor::zeros((batch, num_heads, q_span.len, head_dim), DType::F32, device)?;

        for k_span in k_chunks.clone() {
            let k_chunk = rows_of(&k32, &k_span)?;
            let v_chunk = rows_of(&v32, &k_span)?;
            let chunk_mask = pair_mask(device, rows.as_ref(), &q_span, &k_span, offset)?;

            let scores = masked_scores(&q_chunk, &k_chunk, scale, chunk_mask.as_ref())?;
            let mut probs = scores
                .broadcast_sub(&max_chunk)?
                .exp()?
                .broadcast_div(&sum_chunk)?;
            if let Some(chunk_mask) = &chunk_mask {
                probs = chunk_mask.zero_masked(&probs)?;
            }

            let idx = k_span.index;
            dv_parts[idx] = (&dv_parts[idx] + probs.t()?.matmul(&d_out_chunk)?)?;

            let d_probs = d_out_chunk.matmul(&v_chunk.t()?)?;
            let d_scores = (d_probs.broadcast_sub(&delta)? * &probs)?.affine(scale, 0.0)?;

            dq_chunk = (dq_chunk + d_scores.matmul(&k_chunk)?)?;
            dk_parts[idx] = (&dk_parts[idx] + d_scores.t()?.matmul(&q_chunk)?)?;
        }

        dq_parts.push(dq_chunk);
    }

    let dq = Tensor::cat(&dq_parts, 2)?;
    let dk = Tensor::cat(&dk_parts, 2)?;
    let dv = Tensor::cat(&dv_parts, 2)?;
    for (name, grad) in [("dq", &dq), ("dk", &dk), ("dv", &dv)] {
        ensure_finite(name, grad)?;
    }

    Ok(Gradients {
        dq: dq.to_dtype(q.dtype())?,
        dk: dk.to_dtype(k.dtype())?,
        dv: dv.to_dtype(v.dtype())?,
    })
}
