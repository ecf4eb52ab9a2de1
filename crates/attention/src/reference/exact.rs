//! Reference dense attention kernel.
//!
//! The exact path prioritises numerical fidelity and mirrors the masking
//! semantics of the chunked engine: the same per-row validity mask, the same
//! causal alignment, and the same epsilon floor for fully masked rows.

use std::sync::OnceLock;

use candle_core::{DType, Tensor, D};

use crate::core::{Attention, AttentionError, AttentionShape, Config};
use crate::masks::{causal_offset, keep_grid, needs_mask, ChunkMask, RowMask};
use crate::tiling::ChunkSpan;

/// Full-matrix attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for ExactAttention {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&RowMask>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init causal={} epsilon={:e} device={:?}",
                config.causal,
                config.epsilon,
                q.device().location()
            );
        }
        dense_attention(q, k, v, mask, config)
    }
}

/// Dense attention over the whole `[q_len, k_len]` score matrix.
///
/// Every operation used here is differentiable by candle, so gradients with
/// respect to `q`, `k` and `v` come from the generic autograd engine.
pub fn dense_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&RowMask>,
    config: &Config,
) -> Result<Tensor, AttentionError> {
    config.validate()?;
    let shape = AttentionShape::from_qkv(q, k, v)?;
    if let Some(mask) = mask {
        mask.validate(&shape, q.device())?;
    }

    let dtype = q.dtype();
    if shape.q_len == 0 || shape.k_len == 0 {
        return Ok(q.zeros_like()?);
    }

    let q = q.to_dtype(DType::F32)?.contiguous()?;
    let k = k.to_dtype(DType::F32)?.contiguous()?;
    let v = v.to_dtype(DType::F32)?.contiguous()?;

    let all_queries = ChunkSpan {
        index: 0,
        start: 0,
        len: shape.q_len,
    };
    let all_keys = ChunkSpan {
        index: 0,
        start: 0,
        len: shape.k_len,
    };
    let rows = mask.map(|mask| mask.rows(0, shape.q_len)).transpose()?;
    let offset = causal_offset(shape.q_len, shape.k_len);
    let grid = if config.causal && needs_mask(&all_queries, &all_keys, offset) {
        Some(keep_grid(q.device(), &all_queries, &all_keys, offset)?)
    } else {
        None
    };
    let keep = ChunkMask::combine(rows.as_ref(), grid.as_ref())?;

    let mut scores = q.matmul(&k.t()?)?.affine(shape.scale(), 0.0)?;
    if let Some(keep) = &keep {
        scores = keep.fill_scores(&scores)?;
    }
    let row_max = scores.max_keepdim(D::Minus1)?;
    let mut weights = scores.broadcast_sub(&row_max)?.exp()?;
    if let Some(keep) = &keep {
        weights = keep.zero_masked(&weights)?;
    }
    let row_sum = weights.sum_keepdim(D::Minus1)?.maximum(config.epsilon)?;
    let probs = weights.broadcast_div(&row_sum)?;

    Ok(probs.matmul(&v)?.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Result as CandleResult};

    fn build_inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let data: Vec<f32> = (0..64).map(|i| (i as f32) * 0.01).collect();
        let q = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let k = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let v = Tensor::from_vec(data, (1, 2, 4, 8), device)?;
        Ok((q, k, v))
    }

    /// Scalar-loop attention with the same row-mask and causal rules.
    fn naive_attention(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        row_valid: Option<&[bool]>,
        causal: bool,
    ) -> CandleResult<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, _, k_len, _) = k.dims4()?;
        let mut output = vec![0f32; batch * heads * q_len * head_dim];

        let q_vec = q.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.flatten_all()?.to_vec1::<f32>()?;
        let scale = 1.0 / (head_dim as f32).sqrt();
        let offset = k_len.saturating_sub(q_len);

        for b in 0..batch {
            for h in 0..heads {
                for q_idx in 0..q_len {
                    if let Some(valid) = row_valid {
                        if q_idx < valid.len() && !valid[q_idx] {
                            continue;
                        }
                    }
                    let visible = if causal { (q_idx + offset + 1).min(k_len) } else { k_len };
                    let mut row = vec![0f32; visible];
                    let mut max_val = f32::NEG_INFINITY;
                    for (k_idx, slot) in row.iter_mut().enumerate() {
                        let mut dot = 0f32;
                        for d in 0..head_dim {
                            let qi = ((b * heads + h) * q_len + q_idx) * head_dim + d;
                            let ki = ((b * heads + h) * k_len + k_idx) * head_dim + d;
                            dot += q_vec[qi] * k_vec[ki];
                        }
                        *slot = dot * scale;
                        max_val = max_val.max(*slot);
                    }
                    let mut denom = 0f32;
                    for val in row.iter_mut() {
                        *val = (*val - max_val).exp();
                        denom += *val;
                    }
                    for d in 0..head_dim {
                        let mut acc = 0f32;
                        for (k_idx, weight) in row.iter().enumerate() {
                            let vi = ((b * heads + h) * k_len + k_idx) * head_dim + d;
                            acc += weight / denom * v_vec[vi];
                        }
                        let oi = ((b * heads + h) * q_len + q_idx) * head_dim + d;
                        output[oi] = acc;
                    }
                }
            }
        }

        Tensor::from_vec(output, (batch, heads, q_len, head_dim), q.device())
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_vec0::<f32>()
    }

    #[test]
    fn exact_attention_matches_naive() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let attention = ExactAttention::default();
        let config = Config::default().causal(true);
        let output = attention.attend(&q, &k, &v, None, &config).unwrap();
        let expected = naive_attention(&q, &k, &v, None, true)?;
        assert!(max_diff(&output, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn row_mask_zeroes_whole_rows() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let valid = [true, false, true, false];
        let mask = RowMask::from_booleans(&device, &[valid.to_vec()]).unwrap();
        let output = dense_attention(&q, &k, &v, Some(&mask), &Config::default()).unwrap();
        let expected = naive_attention(&q, &k, &v, Some(&valid), false)?;
        assert!(max_diff(&output, &expected)? < 1e-4);

        let row1 = output.narrow(2, 1, 1)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(row1.iter().all(|v| *v == 0.0));
        Ok(())
    }

    #[test]
    fn cross_lengths_align_causal_queries_with_latest_keys() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (1, 1, 2, 4), &device)?;
        let k = Tensor::randn(0f32, 1.0, (1, 1, 5, 4), &device)?;
        let v = Tensor::randn(0f32, 1.0, (1, 1, 5, 4), &device)?;
        let config = Config::default().causal(true);
        let output = dense_attention(&q, &k, &v, None, &config).unwrap();
        let expected = naive_attention(&q, &k, &v, None, true)?;
        assert!(max_diff(&output, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 5, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let err = ExactAttention::default()
            .attend(&q, &k, &v, None, &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::ShapeMismatch { .. }));
    }

    #[test]
    fn mask_length_validation() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let mask = RowMask::from_lengths(&device, &[2], 3).unwrap();
        let err = ExactAttention::default()
            .attend(&q, &q, &q, Some(&mask), &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::ShapeMismatch { .. }));
    }

    #[test]
    fn dtype_matrix() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let config = Config::default().causal(true);
        let reference = dense_attention(&q, &k, &v, None, &config).unwrap();
        for dtype in [DType::F32, DType::BF16, DType::F16] {
            let out = dense_attention(
                &q.to_dtype(dtype)?,
                &k.to_dtype(dtype)?,
                &v.to_dtype(dtype)?,
                None,
                &config,
            )
            .unwrap();
            assert_eq!(out.dtype(), dtype);
            let max = max_diff(&out, &reference)?;
            assert!(max < 5e-2, "dtype {:?} diverged by {max}", dtype);
        }
        Ok(())
    }

    #[test]
    fn numerical_stability() {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 1, 4, 4), &device).unwrap();
        let k = Tensor::full(-10_000.0f32, (1, 1, 4, 4), &device).unwrap();
        let v = Tensor::ones((1, 1, 4, 4), DType::F32, &device).unwrap();
        let out = dense_attention(&q, &k, &v, None, &Config::default())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(out.iter().all(|value| value.is_finite()));
    }
}
