//! Memory-bounded scaled dot-product attention.
//!
//! The crate computes attention over tensors with layout
//! `[batch, n_heads, seq_len, head_dim]` without materialising the
//! `[q_len, k_len]` score matrix. Queries and keys/values are split into
//! chunks ([`tiling`]); each query chunk folds key/value blocks into an online
//! softmax accumulator ([`online`]), and the backward pass recomputes the
//! attention weights from the saved per-row max and sum ([`flash`]).
//!
//! Two strategies implement the [`Attention`] trait:
//!
//! * [`reference::ExactAttention`] materialises the full score matrix and is
//!   differentiated by candle's autograd;
//! * [`flash::FlashAttention`] uses bounded working memory and registers its
//!   hand-derived backward pass with candle's graph.
//!
//! Masking follows two rules ([`masks`]): an optional `[batch, k_len]`
//! validity mask whose bit `i` governs query row `i` as a whole, and an
//! optional causal predicate aligning queries with the most recent keys.
//! Arithmetic is performed in `f32`; outputs and gradients match the dtype of
//! their inputs.

pub mod core;
pub mod flash;
pub mod masks;
pub mod online;
pub mod reference;
pub mod tiling;

pub use self::core::{Attention, AttentionError, AttentionShape, Config};
pub use flash::{backward, flash_attention, forward, FlashAttention, Gradients, SavedState};
pub use masks::RowMask;
pub use reference::ExactAttention;
