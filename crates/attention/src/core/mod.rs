//! Core traits and types shared across attention implementations.
//!
//! Implementations operate on tensors with layout
//! `[batch, n_heads, seq_len, head_dim]`. Keys and values share a sequence
//! length that may differ from the query length. The output tensor mirrors the
//! query layout and dtype, while arithmetic is carried out in `f32` regardless
//! of the incoming dtype (`bf16`, `f16`, or `f32`).

pub mod checks;
pub mod config;
pub mod errors;

use candle_core::Tensor;

use crate::masks::RowMask;

pub use checks::AttentionShape;
pub use config::Config;
pub use errors::AttentionError;

/// Unified interface for attention strategies.
///
/// * `q` is `[batch, n_heads, q_len, head_dim]`; `k` and `v` are
///   `[batch, n_heads, k_len, head_dim]`.
/// * The returned tensor mirrors the layout and dtype of `q`.
/// * `mask`, when present, is a per-row validity mask shaped `[batch, k_len]`.
/// * Causality and chunking are controlled through [`Config`].
///
/// Host networks hold a strategy behind `Arc<dyn Attention>` picked once at
/// construction time.
pub trait Attention: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Compute scaled dot-product attention.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&RowMask>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}
