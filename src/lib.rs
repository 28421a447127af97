//! # Inferir
//!
//! Governed CPU inference for transformer language models.
//!
//! Inferir (Spanish: "to infer") loads model weights from GGUF containers
//! (full precision or block-quantized), runs KV-cached causal attention on
//! vectorized CPU kernels, and wraps raw forward passes into governed,
//! streamable generation sessions with token budgets, wall-clock limits,
//! cancellation, and seed-reproducible sampling.
//!
//! ## Features
//!
//! - **Quantized loading**: F32, F16, Q4_0, Q4_1, Q8_0, Q4_K, Q6_K, eagerly
//!   dequantized or kept packed and dequantized per tile during matmul
//! - **Incremental decoding**: per-session KV cache arena with causal masking
//!   offset by the cached length, numerically equivalent to full-block passes
//! - **No steady-state allocation**: every kernel scratch buffer is rented
//!   from a size-classed [`pool::BufferPool`]
//! - **Governance**: input/context/new-token budgets, timeouts, cooperative
//!   cancellation, bounded engine concurrency
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use inferir::engine::InferenceEngine;
//! use inferir::config::EngineConfig;
//! use inferir::session::InferenceOptions;
//! use inferir::testing::{random_weights, tiny_config};
//! use inferir::tokenizer::ByteTokenizer;
//!
//! let weights = Arc::new(random_weights(&tiny_config(), 42));
//! let tokenizer = ByteTokenizer::with_specials(Some(256), Some(257)).unwrap();
//! let engine = InferenceEngine::new(weights, Arc::new(tokenizer), EngineConfig::default()).unwrap();
//!
//! let options = InferenceOptions::default().with_seed(7).with_max_new_tokens(8);
//! let output = engine.try_session(options).unwrap().generate("Hello").unwrap();
//! assert!(output.tokens.len() <= 8);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! engine ─► session ─► model::Transformer ─► attention (+ KvCache) ─► kernels
//!              │              │                                        ▲
//!              ▼              ▼                                        │
//!          generate       model::ModelWeights ◄─ gguf ◄─ quantize     pool
//!          tokenizer           ▲
//!                          checkpoint
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)] // usize -> f32 precision loss is acceptable
#![allow(clippy::cast_possible_truncation)] // u128 -> u64 for durations is safe
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)] // Allow technical terms without backticks
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::float_cmp)] // Exact comparisons against 0.0 / 1.0 sentinels
#![allow(clippy::similar_names)] // q/k/v naming

/// Multi-head causal attention and the per-session KV cache
pub mod attention;
/// Full-precision checkpoint save/load in canonical parameter order
pub mod checkpoint;
/// Engine configuration (JSON + environment) and logging setup
pub mod config;
/// Bounded-concurrency engine over shared weights
pub mod engine;
/// Error taxonomy
pub mod error;
/// Next-token sampling
pub mod generate;
/// GGUF container reader, validator and writer
pub mod gguf;
/// Vectorized CPU kernels
///
/// Matrix multiply (plain and transpose-B) over strided views, fused
/// scale + causal mask + softmax, norms, activations.
pub mod kernels;
/// Model configuration, weights and the transformer forward pass
pub mod model;
/// Size-classed scratch-buffer pool
pub mod pool;
/// Block quantization formats
pub mod quantize;
/// Governed generation sessions
pub mod session;
/// Tensor type
pub mod tensor;
/// Deterministic tiny-model fixtures for tests and benchmarks
pub mod testing;
/// Tokenizer contract and built-in tokenizers
pub mod tokenizer;

pub use error::{InferirError, Result};
pub use tensor::Tensor;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
