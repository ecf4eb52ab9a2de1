//! Portable, dense implementation of scaled dot-product attention.
//!
//! This path materialises the full score matrix and relies on candle's own
//! autograd for gradients. It serves as the standard strategy for short
//! sequences and as the baseline for validating the chunked kernels.

pub mod exact;

pub use exact::{dense_attention, ExactAttention};
