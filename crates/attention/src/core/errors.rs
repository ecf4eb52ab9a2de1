//! Error types emitted by the attention engine.

/// Attention-specific error category.
///
/// Every variant is raised synchronously at the point of violation. Nothing is
/// retried internally; retry policy belongs to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum AttentionError {
    /// Dimensions of `q`, `k`, `v`, the mask or an upstream gradient disagree.
    ShapeMismatch { context: String },
    /// A configuration knob is out of range, or backward was invoked without
    /// the saved state of a matching forward pass.
    InvalidConfiguration { context: String },
    /// A running statistic or gradient became non-finite.
    NumericOverflow { context: String },
    /// The kernel does not support the requested data type.
    UnsupportedDType { requested: String },
    /// A backend-specific failure propagated to the caller.
    Backend { message: String },
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
        }
    }

    pub(crate) fn config(context: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            context: context.into(),
        }
    }
}

impl std::fmt::Display for AttentionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttentionError::ShapeMismatch { context } => {
                write!(f, "shape mismatch: {context}")
            }
            AttentionError::InvalidConfiguration { context } => {
                write!(f, "invalid configuration: {context}")
            }
            AttentionError::NumericOverflow { context } => {
                write!(f, "numeric overflow: {context}")
            }
            AttentionError::UnsupportedDType { requested } => {
                write!(f, "unsupported dtype {requested}")
            }
            AttentionError::Backend { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for AttentionError {}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        AttentionError::Backend {
            message: err.to_string(),
        }
    }
}
