//! Model weights
//!
//! [`ModelWeights`] is built once and then shared read-only (behind an
//! `Arc`) by every session. Projection matrices are stored `[out, in]` and
//! applied as `x · Wᵀ`.
//!
//! Parameters have one canonical order, produced by [`parameter_specs`]:
//! container loading, checkpoint save and checkpoint load all walk it, so a
//! model's parameters line up one-to-one across formats.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::config::{FfnKind, ModelConfig, NormKind, PositionKind};
use crate::error::{InferirError, Result};
use crate::gguf::MappedGguf;
use crate::kernels::{matmul_transpose_b_into_with, MatView, MatViewMut};
use crate::pool::BufferPool;
use crate::quantize::{dequantize, dequantize_into, QuantKind};
use crate::tensor::Tensor;

/// Dequantized elements per tile when multiplying a lazily-held weight
const LAZY_TILE_ELEMENTS: usize = 1 << 16;

/// How quantized tensors are held after load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadPolicy {
    /// Dequantize everything at load
    #[default]
    Materialize,
    /// Keep packed blocks; dequantize row tiles during matmul
    Lazy,
}

impl fmt::Display for LoadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Materialize => "materialize",
            Self::Lazy => "lazy",
        })
    }
}

impl FromStr for LoadPolicy {
    type Err = InferirError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "materialize" => Ok(Self::Materialize),
            "lazy" => Ok(Self::Lazy),
            other => Err(InferirError::validation(format!(
                "Unknown load policy '{other}' (expected materialize or lazy)"
            ))),
        }
    }
}

/// A weight matrix, dense or packed
#[derive(Debug, Clone)]
pub enum Weight {
    /// Full-precision `[rows, cols]`
    Dense(Tensor),
    /// Packed blocks of `kind`, `cols` a multiple of its block size
    Quantized {
        /// Storage kind
        kind: QuantKind,
        /// Output features
        rows: usize,
        /// Input features
        cols: usize,
        /// Packed row-major blocks
        bytes: Vec<u8>,
    },
}

impl Weight {
    /// Output features
    #[must_use]
    pub fn rows(&self) -> usize {
        match self {
            Self::Dense(t) => t.rows(),
            Self::Quantized { rows, .. } => *rows,
        }
    }

    /// Input features
    #[must_use]
    pub fn cols(&self) -> usize {
        match self {
            Self::Dense(t) => t.cols(),
            Self::Quantized { cols, .. } => *cols,
        }
    }

    /// Shape as stored
    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Self::Dense(t) => t.shape().to_vec(),
            Self::Quantized { rows, cols, .. } => vec![*rows, *cols],
        }
    }

    /// Storage kind (`F32` for dense)
    #[must_use]
    pub fn kind(&self) -> QuantKind {
        match self {
            Self::Dense(_) => QuantKind::F32,
            Self::Quantized { kind, .. } => *kind,
        }
    }

    /// Bytes held in memory
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        match self {
            Self::Dense(t) => t.size() * std::mem::size_of::<f32>(),
            Self::Quantized { bytes, .. } => bytes.len(),
        }
    }

    fn row_bytes(kind: QuantKind, cols: usize) -> Result<usize> {
        kind.byte_size(cols)
    }

    /// Full-precision copy
    ///
    /// # Errors
    ///
    /// Returns `Format` if the packed data is inconsistent
    pub fn to_dense(&self) -> Result<Tensor> {
        match self {
            Self::Dense(t) => Ok(t.clone()),
            Self::Quantized {
                kind,
                rows,
                cols,
                bytes,
            } => Tensor::from_vec(vec![*rows, *cols], dequantize(*kind, bytes, rows * cols)?),
        }
    }

    /// Consume into a full-precision tensor
    ///
    /// # Errors
    ///
    /// Returns `Format` if the packed data is inconsistent
    pub fn into_dense(self) -> Result<Tensor> {
        match self {
            Self::Dense(t) => Ok(t),
            packed @ Self::Quantized { .. } => packed.to_dense(),
        }
    }

    /// Copy row `index` (an embedding lookup) into `out`
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `index` is out of range and `ShapeMismatch` if
    /// `out` is not `cols` wide
    pub fn row_into(&self, index: usize, out: &mut [f32]) -> Result<()> {
        if index >= self.rows() {
            return Err(InferirError::validation(format!(
                "Row {index} out of range for {} rows",
                self.rows()
            )));
        }
        if out.len() != self.cols() {
            return Err(InferirError::shape(format!(
                "Row of {} into buffer of {}",
                self.cols(),
                out.len()
            )));
        }
        match self {
            Self::Dense(t) => out.copy_from_slice(t.row(index)?),
            Self::Quantized {
                kind, cols, bytes, ..
            } => {
                let rb = Self::row_bytes(*kind, *cols)?;
                dequantize_into(*kind, &bytes[index * rb..(index + 1) * rb], out)?;
            },
        }
        Ok(())
    }

    /// `out = x · Wᵀ` with `x` `[T, cols]` and `out` `[T, rows]`
    ///
    /// Packed weights are dequantized a tile of rows at a time into scratch
    /// rented from `pool`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `x` or `out` disagree with the weight
    pub fn matmul_t(
        &self,
        x: &[f32],
        out: &mut [f32],
        pool: &BufferPool,
        parallel_threshold: usize,
    ) -> Result<()> {
        let (rows, cols) = (self.rows(), self.cols());
        if x.len() % cols != 0 || out.len() != (x.len() / cols) * rows {
            return Err(InferirError::shape(format!(
                "Projection [{rows}x{cols}] of input {} into output {}",
                x.len(),
                out.len()
            )));
        }
        let t = x.len() / cols;
        let input = MatView::new(x, t, cols)?;

        match self {
            Self::Dense(w) => {
                let mut c = MatViewMut::new(out, t, rows)?;
                matmul_transpose_b_into_with(
                    input,
                    MatView::new(w.data(), rows, cols)?,
                    &mut c,
                    parallel_threshold,
                )
            },
            Self::Quantized { kind, bytes, .. } => {
                let rb = Self::row_bytes(*kind, cols)?;
                let tile_rows = (LAZY_TILE_ELEMENTS / cols).clamp(1, rows);
                let mut scratch = pool.rent(tile_rows * cols);
                let mut r0 = 0;
                while r0 < rows {
                    let n = tile_rows.min(rows - r0);
                    let tile = &mut scratch[..n * cols];
                    dequantize_into(*kind, &bytes[r0 * rb..(r0 + n) * rb], tile)?;
                    let mut c = MatViewMut::strided(out, r0, t, n, rows)?;
                    matmul_transpose_b_into_with(
                        input,
                        MatView::new(tile, n, cols)?,
                        &mut c,
                        parallel_threshold,
                    )?;
                    r0 += n;
                }
                Ok(())
            },
        }
    }
}

/// Name and shape of one parameter in canonical order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    /// Container tensor name
    pub name: String,
    /// Row-major shape
    pub shape: Vec<usize>,
}

fn spec(name: impl Into<String>, shape: &[usize]) -> ParamSpec {
    ParamSpec {
        name: name.into(),
        shape: shape.to_vec(),
    }
}

/// Every parameter `config` implies, in canonical order
#[must_use]
pub fn parameter_specs(config: &ModelConfig) -> Vec<ParamSpec> {
    let (v, h, kv, i) = (
        config.vocab_size,
        config.hidden_dim,
        config.kv_dim(),
        config.intermediate_dim,
    );
    let layer_norm = config.norm == NormKind::LayerNorm;
    let mut specs = vec![spec("token_embd.weight", &[v, h])];
    if config.position == PositionKind::Learned {
        specs.push(spec("position_embd.weight", &[config.context_length, h]));
    }
    for l in 0..config.num_layers {
        let p = |s: &str| format!("blk.{l}.{s}");
        specs.push(spec(p("attn_norm.weight"), &[h]));
        if layer_norm {
            specs.push(spec(p("attn_norm.bias"), &[h]));
        }
        specs.push(spec(p("attn_q.weight"), &[h, h]));
        specs.push(spec(p("attn_k.weight"), &[kv, h]));
        specs.push(spec(p("attn_v.weight"), &[kv, h]));
        specs.push(spec(p("attn_output.weight"), &[h, h]));
        if config.attention_bias {
            specs.push(spec(p("attn_q.bias"), &[h]));
            specs.push(spec(p("attn_k.bias"), &[kv]));
            specs.push(spec(p("attn_v.bias"), &[kv]));
            specs.push(spec(p("attn_output.bias"), &[h]));
        }
        specs.push(spec(p("ffn_norm.weight"), &[h]));
        if layer_norm {
            specs.push(spec(p("ffn_norm.bias"), &[h]));
        }
        if config.ffn == FfnKind::SwiGlu {
            specs.push(spec(p("ffn_gate.weight"), &[i, h]));
        }
        specs.push(spec(p("ffn_up.weight"), &[i, h]));
        specs.push(spec(p("ffn_down.weight"), &[h, i]));
        if config.ffn_bias {
            specs.push(spec(p("ffn_up.bias"), &[i]));
            specs.push(spec(p("ffn_down.bias"), &[h]));
        }
    }
    specs.push(spec("output_norm.weight", &[h]));
    if layer_norm {
        specs.push(spec("output_norm.bias", &[h]));
    }
    if !config.tied_output {
        specs.push(spec("output.weight", &[v, h]));
    }
    specs
}

/// Weights of one transformer block
#[derive(Debug, Clone)]
pub struct LayerWeights {
    /// Pre-attention norm weight
    pub attn_norm: Tensor,
    /// Pre-attention norm bias (LayerNorm only)
    pub attn_norm_bias: Option<Tensor>,
    /// Query projection `[hidden, hidden]`
    pub attn_q: Weight,
    /// Key projection `[kv_dim, hidden]`
    pub attn_k: Weight,
    /// Value projection `[kv_dim, hidden]`
    pub attn_v: Weight,
    /// Output projection `[hidden, hidden]`
    pub attn_output: Weight,
    /// Query bias
    pub attn_q_bias: Option<Tensor>,
    /// Key bias
    pub attn_k_bias: Option<Tensor>,
    /// Value bias
    pub attn_v_bias: Option<Tensor>,
    /// Output projection bias
    pub attn_output_bias: Option<Tensor>,
    /// Pre-FFN norm weight
    pub ffn_norm: Tensor,
    /// Pre-FFN norm bias (LayerNorm only)
    pub ffn_norm_bias: Option<Tensor>,
    /// Gate projection (SwiGLU only)
    pub ffn_gate: Option<Weight>,
    /// Up projection `[intermediate, hidden]`
    pub ffn_up: Weight,
    /// Down projection `[hidden, intermediate]`
    pub ffn_down: Weight,
    /// Up projection bias
    pub ffn_up_bias: Option<Tensor>,
    /// Down projection bias
    pub ffn_down_bias: Option<Tensor>,
}

/// Immutable weights plus the hyperparameters they were built for
#[derive(Debug, Clone)]
pub struct ModelWeights {
    /// Hyperparameters
    pub config: ModelConfig,
    /// Token embedding `[vocab, hidden]`
    pub token_embd: Weight,
    /// Learned position embedding `[context, hidden]`
    pub position_embd: Option<Tensor>,
    /// Transformer blocks
    pub layers: Vec<LayerWeights>,
    /// Final norm weight
    pub output_norm: Tensor,
    /// Final norm bias (LayerNorm only)
    pub output_norm_bias: Option<Tensor>,
    /// Output head `[vocab, hidden]`; `None` when tied to `token_embd`
    pub output: Option<Weight>,
}

/// Parameters keyed by name while a model is assembled
struct ParamSource {
    params: BTreeMap<String, Weight>,
}

impl ParamSource {
    fn weight(&mut self, name: &str) -> Result<Weight> {
        self.params
            .remove(name)
            .ok_or_else(|| InferirError::format(format!("Missing tensor '{name}'")))
    }

    fn tensor(&mut self, name: &str) -> Result<Tensor> {
        self.weight(name)?.into_dense()
    }

    fn opt_tensor(&mut self, name: &str, present: bool) -> Result<Option<Tensor>> {
        present.then(|| self.tensor(name)).transpose()
    }
}

impl ModelWeights {
    fn assemble(config: ModelConfig, mut src: ParamSource) -> Result<Self> {
        let ln = config.norm == NormKind::LayerNorm;
        let ab = config.attention_bias;
        let fb = config.ffn_bias;

        let token_embd = src.weight("token_embd.weight")?;
        let position_embd =
            src.opt_tensor("position_embd.weight", config.position == PositionKind::Learned)?;
        let mut layers = Vec::with_capacity(config.num_layers);
        for l in 0..config.num_layers {
            let p = |s: &str| format!("blk.{l}.{s}");
            layers.push(LayerWeights {
                attn_norm: src.tensor(&p("attn_norm.weight"))?,
                attn_norm_bias: src.opt_tensor(&p("attn_norm.bias"), ln)?,
                attn_q: src.weight(&p("attn_q.weight"))?,
                attn_k: src.weight(&p("attn_k.weight"))?,
                attn_v: src.weight(&p("attn_v.weight"))?,
                attn_output: src.weight(&p("attn_output.weight"))?,
                attn_q_bias: src.opt_tensor(&p("attn_q.bias"), ab)?,
                attn_k_bias: src.opt_tensor(&p("attn_k.bias"), ab)?,
                attn_v_bias: src.opt_tensor(&p("attn_v.bias"), ab)?,
                attn_output_bias: src.opt_tensor(&p("attn_output.bias"), ab)?,
                ffn_norm: src.tensor(&p("ffn_norm.weight"))?,
                ffn_norm_bias: src.opt_tensor(&p("ffn_norm.bias"), ln)?,
                ffn_gate: (config.ffn == FfnKind::SwiGlu)
                    .then(|| src.weight(&p("ffn_gate.weight")))
                    .transpose()?,
                ffn_up: src.weight(&p("ffn_up.weight"))?,
                ffn_down: src.weight(&p("ffn_down.weight"))?,
                ffn_up_bias: src.opt_tensor(&p("ffn_up.bias"), fb)?,
                ffn_down_bias: src.opt_tensor(&p("ffn_down.bias"), fb)?,
            });
        }
        let output_norm = src.tensor("output_norm.weight")?;
        let output_norm_bias = src.opt_tensor("output_norm.bias", ln)?;
        let output = (!config.tied_output)
            .then(|| src.weight("output.weight"))
            .transpose()?;

        let weights = Self {
            config,
            token_embd,
            position_embd,
            layers,
            output_norm,
            output_norm_bias,
            output,
        };
        weights.validate()?;
        Ok(weights)
    }

    /// Check every parameter against the shape its config implies
    ///
    /// # Errors
    ///
    /// Returns `Format` naming the first mismatching tensor; an embedding or
    /// output head whose row count differs from the vocabulary size is
    /// reported as a vocabulary mismatch
    pub fn validate(&self) -> Result<()> {
        self.config
            .validate()
            .map_err(|e| InferirError::format(format!("Model config: {e}")))?;
        let v = self.config.vocab_size;
        let heads = std::iter::once(("token_embd.weight", &self.token_embd))
            .chain(self.output.iter().map(|w| ("output.weight", w)));
        for (name, w) in heads {
            if w.rows() != v {
                return Err(InferirError::format(format!(
                    "{name} has {} rows but vocabulary size is {v}",
                    w.rows()
                )));
            }
        }
        for (spec, shape) in parameter_specs(&self.config)
            .into_iter()
            .zip(self.shapes())
        {
            if spec.shape != shape {
                return Err(InferirError::format(format!(
                    "Tensor '{}' has shape {shape:?}, expected {:?}",
                    spec.name, spec.shape
                )));
            }
        }
        Ok(())
    }

    /// Shapes in canonical order
    fn shapes(&self) -> Vec<Vec<usize>> {
        let mut out = Vec::new();
        self.for_each_param(|_, p| {
            out.push(match p {
                Param::Weight(w) => w.shape(),
                Param::Tensor(t) => t.shape().to_vec(),
            });
        });
        out
    }

    fn for_each_param<'a>(&'a self, mut f: impl FnMut(usize, Param<'a>)) {
        let mut i = 0;
        let mut emit = |p: Param<'a>| {
            f(i, p);
            i += 1;
        };
        emit(Param::Weight(&self.token_embd));
        if let Some(t) = &self.position_embd {
            emit(Param::Tensor(t));
        }
        for layer in &self.layers {
            emit(Param::Tensor(&layer.attn_norm));
            if let Some(t) = &layer.attn_norm_bias {
                emit(Param::Tensor(t));
            }
            emit(Param::Weight(&layer.attn_q));
            emit(Param::Weight(&layer.attn_k));
            emit(Param::Weight(&layer.attn_v));
            emit(Param::Weight(&layer.attn_output));
            for t in [
                &layer.attn_q_bias,
                &layer.attn_k_bias,
                &layer.attn_v_bias,
                &layer.attn_output_bias,
            ]
            .into_iter()
            .flatten()
            {
                emit(Param::Tensor(t));
            }
            emit(Param::Tensor(&layer.ffn_norm));
            if let Some(t) = &layer.ffn_norm_bias {
                emit(Param::Tensor(t));
            }
            if let Some(w) = &layer.ffn_gate {
                emit(Param::Weight(w));
            }
            emit(Param::Weight(&layer.ffn_up));
            emit(Param::Weight(&layer.ffn_down));
            for t in [&layer.ffn_up_bias, &layer.ffn_down_bias].into_iter().flatten() {
                emit(Param::Tensor(t));
            }
        }
        emit(Param::Tensor(&self.output_norm));
        if let Some(t) = &self.output_norm_bias {
            emit(Param::Tensor(t));
        }
        if let Some(w) = &self.output {
            emit(Param::Weight(w));
        }
    }

    /// Output head (the token embedding when tied)
    #[must_use]
    pub fn output_head(&self) -> &Weight {
        self.output.as_ref().unwrap_or(&self.token_embd)
    }

    /// Total parameter count
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        parameter_specs(&self.config)
            .iter()
            .map(|s| s.shape.iter().product::<usize>())
            .sum()
    }

    /// Bytes held by all parameters
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        let mut total = 0;
        self.for_each_param(|_, p| {
            total += match p {
                Param::Weight(w) => w.memory_bytes(),
                Param::Tensor(t) => t.size() * std::mem::size_of::<f32>(),
            };
        });
        total
    }

    /// Full-precision copies of every parameter in canonical order
    ///
    /// # Errors
    ///
    /// Returns `Format` if a packed weight fails to dequantize
    pub fn parameters(&self) -> Result<Vec<(String, Tensor)>> {
        let specs = parameter_specs(&self.config);
        let mut out = Vec::with_capacity(specs.len());
        let mut failure = None;
        self.for_each_param(|i, p| {
            let dense = match p {
                Param::Weight(w) => w.to_dense(),
                Param::Tensor(t) => Ok(t.clone()),
            };
            match dense {
                Ok(t) => out.push((specs[i].name.clone(), t)),
                Err(e) => {
                    failure.get_or_insert(e);
                },
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// Build dense weights from tensors in canonical order
    ///
    /// # Errors
    ///
    /// Returns `Format` if the tensor count or any tensor's shape differs
    /// from what `config` implies
    pub fn from_parameters(config: ModelConfig, tensors: Vec<Tensor>) -> Result<Self> {
        let specs = parameter_specs(&config);
        if tensors.len() != specs.len() {
            return Err(InferirError::format(format!(
                "Expected {} tensors for this model, got {}",
                specs.len(),
                tensors.len()
            )));
        }
        let mut params = BTreeMap::new();
        for (spec, tensor) in specs.into_iter().zip(tensors) {
            if tensor.shape() != spec.shape.as_slice() {
                return Err(InferirError::format(format!(
                    "Tensor '{}' has {} elements in shape {:?}, expected {:?}",
                    spec.name,
                    tensor.size(),
                    tensor.shape(),
                    spec.shape
                )));
            }
            params.insert(spec.name, Weight::Dense(tensor));
        }
        Self::assemble(config, ParamSource { params })
    }

    /// Build weights from a parsed container
    ///
    /// # Errors
    ///
    /// Returns `Format` if the header is incomplete, a tensor is missing or
    /// has the wrong shape, the vocabulary-dependent tensors disagree with
    /// the vocabulary size, or tensor data fails to decode
    pub fn from_gguf(container: &MappedGguf, policy: LoadPolicy) -> Result<Self> {
        let config = ModelConfig::from_gguf(&container.file)?;
        let mut params = BTreeMap::new();
        let mut lazy = 0usize;
        for spec in parameter_specs(&config) {
            let (info, bytes) = container.tensor_bytes(&spec.name)?;
            if info.shape != spec.shape {
                let vocab_bound = spec.name == "token_embd.weight" || spec.name == "output.weight";
                return Err(InferirError::format(if vocab_bound {
                    format!(
                        "'{}' shape {:?} disagrees with vocabulary size {} (expected {:?})",
                        spec.name, info.shape, config.vocab_size, spec.shape
                    )
                } else {
                    format!(
                        "Tensor '{}' has shape {:?}, expected {:?}",
                        spec.name, info.shape, spec.shape
                    )
                }));
            }
            let keep_packed = policy == LoadPolicy::Lazy
                && info.kind != QuantKind::F32
                && info.shape.len() == 2
                && info.shape[1] % info.kind.block_size() == 0;
            let weight = if keep_packed {
                lazy += 1;
                Weight::Quantized {
                    kind: info.kind,
                    rows: info.shape[0],
                    cols: info.shape[1],
                    bytes: bytes.to_vec(),
                }
            } else {
                let values = dequantize(info.kind, bytes, info.element_count()?)?;
                Weight::Dense(Tensor::from_vec(info.shape.clone(), values)?)
            };
            debug!(name = %spec.name, kind = %info.kind, shape = ?info.shape, packed = keep_packed, "Loaded tensor");
            params.insert(spec.name, weight);
        }
        let weights = Self::assemble(config, ParamSource { params })?;
        info!(
            architecture = %weights.config.architecture,
            layers = weights.config.num_layers,
            vocab = weights.config.vocab_size,
            parameters = weights.parameter_count(),
            packed_tensors = lazy,
            %policy,
            "Model weights loaded"
        );
        Ok(weights)
    }

    /// Memory-map and load a container from disk
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read and `Format` as for
    /// [`ModelWeights::from_gguf`]
    pub fn load<P: AsRef<Path>>(path: P, policy: LoadPolicy) -> Result<Self> {
        let container = MappedGguf::open(path.as_ref())?;
        Self::from_gguf(&container, policy)
    }
}

enum Param<'a> {
    Weight(&'a Weight),
    Tensor(&'a Tensor),
}
