//! Configuration options shared by all attention implementations.
//!
//! The [`Config`] struct captures run-time knobs such as chunk sizes and the
//! causal flag. Values are passed explicitly into every call; the engine keeps
//! no ambient defaults of its own.

use serde::{Deserialize, Serialize};

use super::AttentionError;

/// Query rows processed together by the chunked kernel.
pub const DEFAULT_Q_CHUNK_SIZE: usize = 512;
/// Key/value rows processed together by the chunked kernel.
pub const DEFAULT_K_CHUNK_SIZE: usize = 1024;
/// Floor applied to per-block softmax denominators.
pub const DEFAULT_EPSILON: f32 = 1e-6;

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of query rows per chunk. Must be at least one.
    pub q_chunk_size: usize,
    /// Number of key/value rows per chunk. Must be at least one.
    pub k_chunk_size: usize,
    /// Lower bound for block row sums, keeping fully-masked rows finite.
    pub epsilon: f32,
    /// Restrict each query to keys at or before its aligned position.
    pub causal: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            q_chunk_size: DEFAULT_Q_CHUNK_SIZE,
            k_chunk_size: DEFAULT_K_CHUNK_SIZE,
            epsilon: DEFAULT_EPSILON,
            causal: false,
        }
    }
}

impl Config {
    /// Builds a configuration with explicit chunk sizes and defaults elsewhere.
    pub fn with_chunks(q_chunk_size: usize, k_chunk_size: usize) -> Self {
        Self {
            q_chunk_size,
            k_chunk_size,
            ..Self::default()
        }
    }

    /// Returns a copy with the causal flag set.
    pub fn causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    /// Checks every knob and reports all violations at once.
    pub fn validate(&self) -> Result<(), AttentionError> {
        let mut errors = Vec::new();

        if self.q_chunk_size == 0 {
            errors.push("q_chunk_size must be greater than 0".to_string());
        }
        if self.k_chunk_size == 0 {
            errors.push("k_chunk_size must be greater than 0".to_string());
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            errors.push(format!(
                "epsilon must be positive and finite, got {}",
                self.epsilon
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AttentionError::config(errors.join("; ")))
        }
    }
}
