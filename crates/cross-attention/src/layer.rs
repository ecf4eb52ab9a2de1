//! The cross-attention layer.
//!
//! Hidden states `[batch, seq, query_dim]` are projected to queries, the
//! context `[batch, ctx_seq, context_dim]` (or the hidden states themselves)
//! to keys and values. Projections are split into heads, attended by the
//! selected strategy, merged back and passed through the output projection.

use std::fmt;
use std::sync::Arc;

use candle_core::{Tensor, D};
use candle_nn::{Linear, Module, VarBuilder};
use chunked_attention::{Attention, AttentionError, Config, RowMask};

use crate::config::CrossAttentionConfig;
use crate::error::Result;
use crate::hook::ContextHook;

pub struct CrossAttention {
    query_dim: usize,
    context_dim: usize,
    heads: usize,
    head_dim: usize,
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    strategy: Arc<dyn Attention>,
    attention_config: Config,
    hook: Option<Arc<dyn ContextHook>>,
}

impl fmt::Debug for CrossAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossAttention")
            .field("query_dim", &self.query_dim)
            .field("context_dim", &self.context_dim)
            .field("heads", &self.heads)
            .field("head_dim", &self.head_dim)
            .field("strategy", &self.strategy.name())
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl CrossAttention {
    /// Creates the projections under `vb` as `to_q`, `to_k`, `to_v` (no bias)
    /// and `to_out` (with bias).
    pub fn new(config: &CrossAttentionConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let inner = config.inner_dim();
        let to_q = candle_nn::linear_no_bias(config.query_dim, inner, vb.pp("to_q"))?;
        let to_k = candle_nn::linear_no_bias(config.context_dim(), inner, vb.pp("to_k"))?;
        let to_v = candle_nn::linear_no_bias(config.context_dim(), inner, vb.pp("to_v"))?;
        let to_out = candle_nn::linear(inner, config.query_dim, vb.pp("to_out"))?;
        Self::from_parts(config, to_q, to_k, to_v, to_out)
    }

    /// Wraps projections supplied by the host network.
    ///
    /// Weight shapes must agree with `config`: `to_q` maps `query_dim` to
    /// `heads * head_dim`, `to_k`/`to_v` map the context width to the same,
    /// `to_out` maps back to `query_dim`.
    pub fn from_parts(
        config: &CrossAttentionConfig,
        to_q: Linear,
        to_k: Linear,
        to_v: Linear,
        to_out: Linear,
    ) -> Result<Self> {
        config.validate()?;
        let inner = config.inner_dim();
        let context_dim = config.context_dim();
        for (name, layer, expected) in [
            ("to_q", &to_q, [inner, config.query_dim]),
            ("to_k", &to_k, [inner, context_dim]),
            ("to_v", &to_v, [inner, context_dim]),
            ("to_out", &to_out, [config.query_dim, inner]),
        ] {
            if layer.weight().dims() != expected {
                return Err(AttentionError::ShapeMismatch {
                    context: format!(
                        "{name} weight expected {expected:?} got {:?}",
                        layer.weight().dims()
                    ),
                }
                .into());
            }
        }

        let strategy = config.backend.build();
        log::info!(
            "cross_attention init query_dim={} context_dim={} heads={} head_dim={} strategy={}",
            config.query_dim,
            context_dim,
            config.heads,
            config.head_dim,
            strategy.name()
        );

        Ok(Self {
            query_dim: config.query_dim,
            context_dim,
            heads: config.heads,
            head_dim: config.head_dim,
            to_q,
            to_k,
            to_v,
            to_out,
            strategy,
            attention_config: config.attention.clone(),
            hook: None,
        })
    }

    /// Installs a hook producing separate key and value contexts.
    pub fn with_context_hook(mut self, hook: Arc<dyn ContextHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Attends `hidden` over `context` (or over itself when `context` is
    /// `None`).
    ///
    /// `mask` is a [`RowMask`] of shape `[batch, ctx_seq]` applied per query
    /// row. The output has the shape and dtype of `hidden`.
    pub fn forward(
        &self,
        hidden: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&RowMask>,
    ) -> Result<Tensor> {
        expect_features("hidden", hidden, self.query_dim)?;
        let dtype = hidden.dtype();
        let context = context.unwrap_or(hidden).to_dtype(dtype)?;

        let (context_k, context_v) = match &self.hook {
            Some(hook) => {
                let (k, v) = hook.transform(hidden, &context)?;
                (k.to_dtype(dtype)?, v.to_dtype(dtype)?)
            }
            None => (context.clone(), context),
        };
        expect_features("context_k", &context_k, self.context_dim)?;
        expect_features("context_v", &context_v, self.context_dim)?;

        let q = self.split_heads(&self.to_q.forward(hidden)?)?;
        let k = self.split_heads(&self.to_k.forward(&context_k)?)?;
        let v = self.split_heads(&self.to_v.forward(&context_v)?)?;

        let attended = self
            .strategy
            .attend(&q, &k, &v, mask, &self.attention_config)?;
        let merged = self.merge_heads(&attended)?;
        Ok(self.to_out.forward(&merged)?)
    }

    /// `[batch, seq, heads * head_dim]` to `[batch, heads, seq, head_dim]`.
    fn split_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let (batch, seq, _) = tensor.dims3()?;
        Ok(tensor
            .reshape((batch, seq, self.heads, self.head_dim))?
            .permute((0, 2, 1, 3))?)
    }

    fn merge_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let (batch, _, seq, _) = tensor.dims4()?;
        Ok(tensor
            .permute((0, 2, 1, 3))?
            .reshape((batch, seq, self.heads * self.head_dim))?)
    }
}

fn expect_features(name: &str, tensor: &Tensor, features: usize) -> Result<()> {
    if tensor.rank() != 3 || tensor.dim(D::Minus1)? != features {
        return Err(AttentionError::ShapeMismatch {
            context: format!(
                "{name} expected [batch, seq, {features}] got {:?}",
                tensor.dims()
            ),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttentionBackend;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn split_and_merge_are_inverse() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = CrossAttention::new(&CrossAttentionConfig::new(12, 3, 4), vb)?;

        let x = Tensor::arange(0f32, 60.0, &device)?.reshape((1, 5, 12))?;
        let heads = layer.split_heads(&x)?;
        assert_eq!(heads.dims(), &[1, 3, 5, 4]);
        // Head 1 of token 2 holds features 4..8 of that token.
        let values = heads.get(0)?.get(1)?.get(2)?.to_vec1::<f32>()?;
        assert_eq!(values, vec![28.0, 29.0, 30.0, 31.0]);

        let merged = layer.merge_heads(&heads)?;
        assert_eq!(
            merged.flatten_all()?.to_vec1::<f32>()?,
            x.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn rejects_projection_shape_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let config = CrossAttentionConfig::new(8, 2, 4).with_backend(AttentionBackend::Standard);
        let good = Linear::new(Tensor::zeros((8, 8), DType::F32, &device)?, None);
        let bad = Linear::new(Tensor::zeros((8, 6), DType::F32, &device)?, None);
        let err = CrossAttention::from_parts(&config, good.clone(), bad, good.clone(), good)
            .unwrap_err();
        assert!(err.to_string().contains("to_k"));
        Ok(())
    }
}
