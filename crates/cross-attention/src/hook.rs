use candle_core::Tensor;

use crate::error::Result;

/// Rewrites the key/value source before projection.
///
/// Receives the hidden states and the (already cast) context. Returns
/// `(context_k, context_v)`; the layer projects the first through `to_k` and
/// the second through `to_v`. Both must keep the batch and sequence axes of
/// the input and carry the layer's context width. Outputs are cast to the
/// dtype of the hidden states.
pub trait ContextHook: Send + Sync {
    fn transform(&self, hidden: &Tensor, context: &Tensor) -> Result<(Tensor, Tensor)>;
}
