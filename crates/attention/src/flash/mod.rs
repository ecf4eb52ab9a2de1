//! Memory-bounded attention built on an online softmax.
//!
//! The forward pass walks query chunks and, inside each, key/value chunks in
//! increasing order, folding every block into a [`RunningStats`] accumulator.
//! Only the per-row `row_max`/`row_sum` statistics are kept for training; the
//! backward pass recomputes the attention weights chunk by chunk from them, so
//! no `[q_len, k_len]` matrix is ever materialised.
//!
//! Peak working memory is `O(q_chunk_size * k_chunk_size)` per batch-head and
//! does not depend on sequence length. Chunk sizes only affect throughput;
//! results are chunk-size invariant up to rounding.
//!
//! [`RunningStats`]: crate::online::RunningStats

pub mod backward;
pub mod forward;
pub mod op;

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor};

use crate::core::{checks, Attention, AttentionError, AttentionShape, Config};
use crate::masks::{keep_grid, needs_mask, ChunkMask, RowMask};
use crate::tiling::ChunkSpan;

pub use backward::{backward, Gradients};
pub use forward::forward;
pub use op::FlashAttentionOp;

/// Per-row statistics retained by [`forward`] for one [`backward`] call.
///
/// Both tensors are `f32` and shaped `[batch, heads, q_len, 1]`.
#[derive(Debug, Clone)]
pub struct SavedState {
    pub row_sum: Tensor,
    pub row_max: Tensor,
}

impl SavedState {
    /// Fails with `InvalidConfiguration` when the statistics were produced by a
    /// forward pass of a different shape.
    pub fn ensure_matches(&self, shape: &AttentionShape) -> Result<(), AttentionError> {
        let expected = shape.stats_dims();
        for (name, tensor) in [("row_sum", &self.row_sum), ("row_max", &self.row_max)] {
            if tensor.dims() != expected {
                return Err(AttentionError::config(format!(
                    "saved {name} {:?} does not belong to a forward pass shaped {:?}",
                    tensor.dims(),
                    expected
                )));
            }
        }
        Ok(())
    }
}

/// Autograd-aware chunked attention.
///
/// Inputs run through [`FlashAttentionOp`], which registers the recomputing
/// backward pass with candle's graph. The op is bound to CPU storage, so
/// tensors on other devices are staged on the host, attended there and moved
/// back; gradients follow the same route in reverse. The generic autograd
/// never sees the per-chunk intermediates on any device.
pub fn flash_attention(
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

    let device = q.device().clone();
    let host = Device::Cpu;
    if !device.is_cpu() {
        log::debug!(
            "chunked attention staged on host from {:?}",
            device.location()
        );
    }

    let mask = mask.map(|mask| mask.to_device(&host)).transpose()?;
    let op = FlashAttentionOp::new(mask, config.clone());
    let q = q.to_device(&host)?.contiguous()?;
    let k = k.to_device(&host)?.contiguous()?;
    let v = v.to_device(&host)?.contiguous()?;
    let output = q.apply_op3(&k, &v, op)?;
    Ok(output.to_device(&device)?)
}

/// Chunked attention strategy.
#[derive(Debug, Default)]
pub struct FlashAttention {
    first_call: OnceLock<()>,
}

impl FlashAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for FlashAttention {
    fn name(&self) -> &'static str {
        "chunked"
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
                "attention::chunked init q_chunk={} k_chunk={} epsilon={:e} causal={} device={:?}",
                config.q_chunk_size,
                config.k_chunk_size,
                config.epsilon,
                config.causal,
                q.device().location()
            );
        }
        flash_attention(q, k, v, mask, config)
    }
}

/// Keep mask for one chunk pair, or `None` when every position is attended.
pub(crate) fn pair_mask(
    device: &Device,
    rows: Option<&Tensor>,
    q_span: &ChunkSpan,
    k_span: &ChunkSpan,
    causal_offset: Option<usize>,
) -> Result<Option<ChunkMask>, AttentionError> {
    let grid = match causal_offset {
        Some(offset) if needs_mask(q_span, k_span, offset) => {
            Some(keep_grid(device, q_span, k_span, offset)?)
        }
        Some(_) => {
            log::trace!(
                "causal mask skipped for q_chunk={} k_chunk={}",
                q_span.index,
                k_span.index
            );
            None
        }
        None => None,
    };
    Ok(ChunkMask::combine(rows, grid.as_ref())?)
}

/// `scale * q · kᵀ` with masked positions forced to the masked score.
pub(crate) fn masked_scores(
    q_chunk: &Tensor,
    k_chunk: &Tensor,
    scale: f64,
    mask: Option<&ChunkMask>,
) -> Result<Tensor, AttentionError> {
    let scores = q_chunk.matmul(&k_chunk.t()?)?.affine(scale, 0.0)?;
    match mask {
        Some(mask) => Ok(mask.fill_scores(&scores)?),
        None => Ok(scores),
    }
}

/// Narrows a `[batch, heads, seq, dim]` tensor to one chunk of rows.
pub(crate) fn rows_of(tensor: &Tensor, span: &ChunkSpan) -> Result<Tensor, AttentionError> {
    Ok(tensor.narrow(2, span.start, span.len)?.contiguous()?)
}

/// Fails with `NumericOverflow` when `tensor` holds a NaN or an infinity.
///
/// Reduces on the tensor's device and only reads back the scalar total,
/// which is non-finite whenever any element is.
pub(crate) fn ensure_finite(name: &str, tensor: &Tensor) -> Result<(), AttentionError> {
    let total = tensor
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_vec0::<f32>()?;
    if !total.is_finite() {
        return Err(AttentionError::NumericOverflow {
            context: format!("{name} contains non-finite values (sum {total})"),
        });
    }
    Ok(())
}

pub(crate) fn ensure_query_shaped(
    name: &str,
    tensor: &Tensor,
    shape: &AttentionShape,
) -> Result<(), AttentionError> {
    checks::expect_dims(name, tensor, &shape.query_dims())?;
    checks::expect_float(name, tensor)
}
