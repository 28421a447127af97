//! Error types for inferir
//!
//! One crate-wide error enum. Kernel and loader errors are never retried
//! internally; `ResourceLimit` is the only variant a caller may reasonably
//! recover from by adjusting options and trying again.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for inferir operations
pub type Result<T> = std::result::Result<T, InferirError>;

/// Resource governed by an [`InferenceOptions`](crate::session::InferenceOptions) budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Prompt tokens after encoding
    InputTokens,
    /// Prompt plus generated tokens held in the KV cache
    ContextTokens,
    /// Tokens produced by the decode loop
    NewTokens,
    /// Sessions admitted by the engine at one time
    ConcurrentSessions,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InputTokens => "input tokens",
            Self::ContextTokens => "context tokens",
            Self::NewTokens => "new tokens",
            Self::ConcurrentSessions => "concurrent sessions",
        };
        f.write_str(name)
    }
}

/// Error type for all inferir operations
#[derive(Debug, Error)]
pub enum InferirError {
    /// Malformed configuration or request options
    #[error("Invalid configuration: {reason}")]
    Validation {
        /// What was wrong
        reason: String,
    },

    /// Kernel or model inputs with inconsistent dimensions
    #[error("Shape mismatch: {reason}")]
    ShapeMismatch {
        /// Dimensions involved
        reason: String,
    },

    /// A request budget was exceeded
    #[error("Resource limit exceeded for {resource}: limit {limit}, actual {actual}")]
    ResourceLimit {
        /// Which budget
        resource: ResourceKind,
        /// Configured limit
        limit: usize,
        /// Observed value
        actual: usize,
    },

    /// Wall-clock budget ran out mid-generation
    #[error("Generation timed out after {elapsed_ms}ms (limit {limit_ms}ms, {tokens_generated} tokens produced)")]
    Timeout {
        /// Time spent when the breach was observed
        elapsed_ms: u64,
        /// Configured limit
        limit_ms: u64,
        /// Tokens produced before the breach
        tokens_generated: usize,
    },

    /// KV cache append past its fixed maximum length
    #[error("KV cache capacity exceeded at layer {layer}: capacity {capacity}, requested {requested}")]
    Capacity {
        /// Layer whose append was refused
        layer: usize,
        /// Fixed maximum sequence length
        capacity: usize,
        /// Length the append would have produced
        requested: usize,
    },

    /// NaN or infinity observed in logits
    #[error("Numeric anomaly at decode step {step}: {reason}")]
    NumericAnomaly {
        /// Decode step index (0 = first generated token)
        step: usize,
        /// What was found
        reason: String,
    },

    /// Model file failed header or tensor validation
    #[error("Format error: {reason}")]
    Format {
        /// What failed validation
        reason: String,
    },

    /// Generation stopped by a cancellation signal
    #[error("Generation cancelled after {tokens_generated} tokens")]
    Cancelled {
        /// Tokens produced before cancellation
        tokens_generated: usize,
    },

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InferirError {
    /// Shorthand for a [`InferirError::Validation`]
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`InferirError::ShapeMismatch`]
    pub fn shape(reason: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`InferirError::Format`]
    pub fn format(reason: impl Into<String>) -> Self {
        Self::Format {
            reason: reason.into(),
        }
    }

    /// Whether a caller may retry with adjusted options
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceLimit { .. })
    }
}
