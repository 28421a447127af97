//! Transformer model
//!
//! - `config`: [`ModelConfig`] hyperparameters and architecture variants
//! - `weights`: [`ModelWeights`], dense or lazily dequantized, loaded from
//!   GGUF containers or built from checkpoint tensors
//! - `rope`: precomputed rotary embedding tables
//! - `transformer`: the [`Transformer`] forward pass in training (full
//!   block) and inference (KV-cached) modes

mod config;
mod rope;
mod transformer;
mod weights;

pub use config::{
    FfnKind, ModelConfig, NormKind, PositionKind, DEFAULT_CONTEXT_LENGTH, DEFAULT_EPS,
    DEFAULT_ROPE_THETA,
};
pub use rope::RopeTable;
pub use transformer::{Mode, Transformer};
pub use weights::{parameter_specs, LayerWeights, LoadPolicy, ModelWeights, ParamSpec, Weight};
