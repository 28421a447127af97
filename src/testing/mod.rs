//! Deterministic model fixtures
//!
//! Small seeded models for tests and benchmarks. The same `(config, seed)`
//! pair always yields bit-identical weights, so fixtures can be rebuilt
//! instead of shipped.
//!
//! ```text
//! tiny_config() → random_weights(seed) → ModelWeights
//!                          ↓
//!              write_gguf_fixture(kind) → GGUF bytes → ModelWeights::from_gguf
//! ```

use std::path::Path;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{InferirError, Result};
use crate::gguf::GgufWriter;
use crate::model::{
    parameter_specs, FfnKind, ModelConfig, ModelWeights, NormKind, PositionKind,
    DEFAULT_ROPE_THETA,
};
use crate::quantize::QuantKind;
use crate::tensor::Tensor;

/// Vocabulary of the byte-level fixtures: 256 bytes plus BOS and EOS
pub const TINY_VOCAB: usize = 258;

/// Two-layer grouped-query llama-style model over the byte vocabulary
#[must_use]
pub fn tiny_config() -> ModelConfig {
    ModelConfig {
        architecture: "llama".to_string(),
        vocab_size: TINY_VOCAB,
        hidden_dim: 16,
        num_layers: 2,
        num_heads: 4,
        num_kv_heads: 2,
        intermediate_dim: 32,
        context_length: 64,
        rope_theta: DEFAULT_ROPE_THETA,
        eps: 1e-5,
        norm: NormKind::RmsNorm,
        ffn: FfnKind::SwiGlu,
        position: PositionKind::Rope,
        attention_bias: false,
        ffn_bias: false,
        tied_output: false,
        bos_token_id: Some(256),
        eos_token_id: Some(257),
        add_bos: true,
    }
}

/// GPT-2 style variant: LayerNorm with biases, GELU MLP, learned positions,
/// tied output head
#[must_use]
pub fn tiny_gpt2_config() -> ModelConfig {
    ModelConfig {
        architecture: "gpt2".to_string(),
        num_kv_heads: 4,
        norm: NormKind::LayerNorm,
        ffn: FfnKind::Gelu,
        position: PositionKind::Learned,
        attention_bias: true,
        ffn_bias: true,
        tied_output: true,
        add_bos: false,
        ..tiny_config()
    }
}

/// Wider model that takes measurable time per token, for benches and
/// wall-clock tests
#[must_use]
pub fn bench_config() -> ModelConfig {
    ModelConfig {
        hidden_dim: 128,
        num_layers: 4,
        num_heads: 8,
        num_kv_heads: 4,
        intermediate_dim: 384,
        context_length: 2048,
        ..tiny_config()
    }
}

fn random_tensors(config: &ModelConfig, seed: u64) -> Result<Vec<Tensor>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    parameter_specs(config)
        .into_iter()
        .map(|spec| {
            let n: usize = spec.shape.iter().product();
            let values = if spec.name.ends_with("norm.weight") {
                vec![1.0; n]
            } else if spec.name.ends_with(".bias") {
                (0..n).map(|_| rng.gen_range(-0.02..0.02)).collect()
            } else {
                // Scaled so activations stay O(1) through the stack
                let fan_in = spec.shape.last().copied().unwrap_or(1) as f32;
                let bound = 1.0 / fan_in.sqrt();
                (0..n).map(|_| rng.gen_range(-bound..bound)).collect()
            };
            Tensor::from_vec(spec.shape, values)
        })
        .collect()
}

/// Seeded dense weights for `config`
///
/// # Errors
///
/// Returns `Validation` if `config` is inconsistent
pub fn try_random_weights(config: &ModelConfig, seed: u64) -> Result<ModelWeights> {
    config.validate()?;
    ModelWeights::from_parameters(config.clone(), random_tensors(config, seed)?)
}

/// Seeded dense weights for `config`
///
/// # Panics
///
/// Panics if `config` is inconsistent; fixtures are built from the known
/// configurations in this module.
#[must_use]
pub fn random_weights(config: &ModelConfig, seed: u64) -> ModelWeights {
    try_random_weights(config, seed)
        .unwrap_or_else(|e| panic!("fixture config rejected: {e}"))
}

/// Seeded weights serialized as a GGUF container
///
/// Matrices whose inner dimension is a whole number of `kind` blocks are
/// encoded as `kind`; vectors and ragged matrices stay F32, the way real
/// quantized checkpoints keep norms at full precision.
///
/// # Errors
///
/// Returns `Validation` if `kind` has no encoder or `config` is inconsistent
pub fn write_gguf_fixture(config: &ModelConfig, kind: QuantKind, seed: u64) -> Result<Vec<u8>> {
    if !kind.can_encode() {
        return Err(InferirError::validation(format!("No encoder for {kind}")));
    }
    config.validate()?;
    let mut writer = config.write_metadata(GgufWriter::new());
    for (spec, tensor) in parameter_specs(config)
        .into_iter()
        .zip(random_tensors(config, seed)?)
    {
        let encodable = tensor.ndim() == 2 && tensor.cols() % kind.block_size() == 0;
        let target = if encodable { kind } else { QuantKind::F32 };
        writer = writer.add_f32_tensor(&spec.name, &tensor, target)?;
    }
    writer.to_bytes()
}

/// [`write_gguf_fixture`] written to `path`
///
/// # Errors
///
/// Returns `Io` on write failure plus everything [`write_gguf_fixture`]
/// returns
pub fn write_gguf_fixture_file<P: AsRef<Path>>(
    path: P,
    config: &ModelConfig,
    kind: QuantKind,
    seed: u64,
) -> Result<()> {
    let bytes = write_gguf_fixture(config, kind, seed)?;
    std::fs::write(path, bytes)?;
    Ok(())
}
