use chunked_attention::AttentionError;
use thiserror::Error;

/// Failures raised while building or running a [`CrossAttention`](crate::CrossAttention).
#[derive(Debug, Error)]
pub enum CrossAttentionError {
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),
    /// A context hook rejected its input.
    #[error("context hook failed: {0}")]
    Hook(String),
}

pub type Result<T> = std::result::Result<T, CrossAttentionError>;
