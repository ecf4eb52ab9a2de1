//! Layer configuration.

use std::sync::Arc;

use chunked_attention::{Attention, AttentionError, Config, ExactAttention, FlashAttention};
use serde::{Deserialize, Serialize};

/// Which attention strategy the layer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionBackend {
    /// Dense attention differentiated by candle's autograd.
    Standard,
    /// Chunked attention with the recomputing backward pass.
    #[default]
    Chunked,
}

impl AttentionBackend {
    pub fn build(self) -> Arc<dyn Attention> {
        match self {
            AttentionBackend::Standard => Arc::new(ExactAttention::new()),
            AttentionBackend::Chunked => Arc::new(FlashAttention::new()),
        }
    }
}

/// Shape and strategy of a [`CrossAttention`](crate::CrossAttention) layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossAttentionConfig {
    /// Feature size of the hidden states (and of the layer output).
    pub query_dim: usize,
    /// Feature size of the context; `None` means self-attention over the
    /// hidden states.
    pub context_dim: Option<usize>,
    pub heads: usize,
    pub head_dim: usize,
    pub backend: AttentionBackend,
    /// Chunking and causality knobs forwarded to the strategy.
    pub attention: Config,
}

impl Default for CrossAttentionConfig {
    fn default() -> Self {
        Self {
            query_dim: 512,
            context_dim: None,
            heads: 8,
            head_dim: 64,
            backend: AttentionBackend::default(),
            attention: Config::default(),
        }
    }
}

impl CrossAttentionConfig {
    pub fn new(query_dim: usize, heads: usize, head_dim: usize) -> Self {
        Self {
            query_dim,
            heads,
            head_dim,
            ..Self::default()
        }
    }

    pub fn with_context_dim(mut self, context_dim: usize) -> Self {
        self.context_dim = Some(context_dim);
        self
    }

    pub fn with_backend(mut self, backend: AttentionBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_attention(mut self, attention: Config) -> Self {
        self.attention = attention;
        self
    }

    /// Width of the projected query/key/value features.
    pub fn inner_dim(&self) -> usize {
        self.heads * self.head_dim
    }

    pub fn context_dim(&self) -> usize {
        self.context_dim.unwrap_or(self.query_dim)
    }

    /// Checks the layer shape and the nested attention config, reporting
    /// every violation at once.
    pub fn validate(&self) -> Result<(), AttentionError> {
        let mut errors = Vec::new();
        if self.query_dim == 0 {
            errors.push("query_dim must be greater than 0".to_string());
        }
        if self.context_dim == Some(0) {
            errors.push("context_dim must be greater than 0 when set".to_string());
        }
        if self.heads == 0 {
            errors.push("heads must be greater than 0".to_string());
        }
        if self.head_dim == 0 {
            errors.push("head_dim must be greater than 0".to_string());
        }
        if let Err(AttentionError::InvalidConfiguration { context }) = self.attention.validate() {
            errors.push(context);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AttentionError::InvalidConfiguration {
                context: errors.join("; "),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CrossAttentionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.inner_dim(), 512);
        assert_eq!(config.context_dim(), 512);
        assert_eq!(config.backend, AttentionBackend::Chunked);
    }

    #[test]
    fn validation_collects_nested_errors() {
        let config = CrossAttentionConfig {
            heads: 0,
            context_dim: Some(0),
            attention: Config::with_chunks(0, 8),
            ..CrossAttentionConfig::default()
        };
        match config.validate() {
            Err(AttentionError::InvalidConfiguration { context }) => {
                assert!(context.contains("heads"));
                assert!(context.contains("context_dim"));
                assert!(context.contains("q_chunk_size"));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn backend_builds_matching_strategy() {
        assert_eq!(AttentionBackend::Standard.build().name(), "exact");
        assert_eq!(AttentionBackend::Chunked.build().name(), "chunked");
    }

    #[test]
    fn config_reads_lowercase_backend() {
        let config: CrossAttentionConfig = serde_json::from_str(
            r#"{"query_dim": 32, "heads": 4, "head_dim": 8, "backend": "standard",
                "attention": {"q_chunk_size": 16}}"#,
        )
        .unwrap();
        assert_eq!(config.backend, AttentionBackend::Standard);
        assert_eq!(config.attention.q_chunk_size, 16);
        assert_eq!(config.attention.k_chunk_size, 1024);
        assert_eq!(config.context_dim, None);

        let json = serde_json::to_string(&config).unwrap();
        let back: CrossAttentionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
