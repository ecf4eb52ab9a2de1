//! Cross-attention layer with an injectable attention strategy.
//!
//! [`CrossAttention`] owns the query/key/value/output projections and a
//! strategy handle picked once at construction from [`AttentionBackend`]. The
//! chunked backend keeps attention memory bounded by the configured chunk
//! sizes and registers its recomputing backward pass with candle's autograd.

pub mod config;
pub mod error;
pub mod hook;
pub mod layer;

pub use config::{AttentionBackend, CrossAttentionConfig};
pub use error::{CrossAttentionError, Result};
pub use hook::ContextHook;
pub use layer::CrossAttention;
