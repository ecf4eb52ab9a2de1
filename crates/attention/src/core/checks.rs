//! Shape and dtype validation shared by the dense and chunked paths.
//!
//! The helpers return [`AttentionError`] so call sites can propagate contract
//! violations before any buffer is touched.

use candle_core::{DType, Tensor};

use super::AttentionError;

/// Logical description of one attention invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionShape {
    /// Batch size for the attention invocation.
    pub batch: usize,
    /// Number of heads processed in parallel.
    pub num_heads: usize,
    /// Query sequence length.
    pub q_len: usize,
    /// Key/value sequence length.
    pub k_len: usize,
    /// Dimensionality per head.
    pub head_dim: usize,
}

impl AttentionShape {
    /// Validates `q`, `k`, `v` against each other and returns the shared shape.
    pub fn from_qkv(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Self, AttentionError> {
        let (batch, num_heads, q_len, head_dim) = dims4("q", q)?;
        let (kb, kh, k_len, kd) = dims4("k", k)?;
        let (vb, vh, vk, vd) = dims4("v", v)?;

        if kb != batch || kh != num_heads || kd != head_dim {
            return Err(AttentionError::shape(format!(
                "k expected [{batch}, {num_heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
            )));
        }
        if vb != batch || vh != num_heads || vk != k_len || vd != head_dim {
            return Err(AttentionError::shape(format!(
                "v expected [{batch}, {num_heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
            )));
        }
        if head_dim == 0 {
            return Err(AttentionError::shape("head_dim must be greater than 0"));
        }

        for (name, tensor) in [("q", q), ("k", k), ("v", v)] {
            expect_float(name, tensor)?;
            if !tensor.device().same_device(q.device()) {
                return Err(AttentionError::shape(format!(
                    "{name} must reside on the same device as q"
                )));
            }
        }

        Ok(Self {
            batch,
            num_heads,
            q_len,
            k_len,
            head_dim,
        })
    }

    /// Softmax temperature `head_dim^-1/2`.
    pub fn scale(&self) -> f64 {
        1.0 / (self.head_dim as f64).sqrt()
    }

    /// Dimensions of query-shaped tensors (`q`, the output, `d_out`).
    pub fn query_dims(&self) -> [usize; 4] {
        [self.batch, self.num_heads, self.q_len, self.head_dim]
    }

    /// Dimensions of the saved per-row statistics.
    pub fn stats_dims(&self) -> [usize; 4] {
        [self.batch, self.num_heads, self.q_len, 1]
    }
}

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_dims(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<(), AttentionError> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(AttentionError::shape(format!(
            "{name} expected {:?}, got {:?}",
            expected,
            tensor.dims()
        )))
    }
}

/// Checks the tensor dtype is one the engine accepts as input.
pub fn expect_float(name: &str, tensor: &Tensor) -> Result<(), AttentionError> {
    match tensor.dtype() {
        DType::F32 | DType::F16 | DType::BF16 => Ok(()),
        other => Err(AttentionError::UnsupportedDType {
            requested: format!("{name}: {other:?}"),
        }),
    }
}

fn dims4(name: &str, tensor: &Tensor) -> Result<(usize, usize, usize, usize), AttentionError> {
    tensor.dims4().map_err(|_| {
        AttentionError::shape(format!(
            "{name} must have shape [batch, heads, seq_len, head_dim], got {:?}",
            tensor.dims()
        ))
    })
}
