//! Full-precision checkpoints
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Magic "INFC" (4 bytes)                        │
//! │ Format version (u32)                          │
//! │ Header length (u64) + JSON header             │
//! │   { format_version, config, tensor_names }    │
//! │ Tensor count (u64)                            │
//! │ Per tensor: ndims (u32), dims (u64 × ndims),  │
//! │             data (f32 × product(dims))        │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! All integers and floats are little-endian. Tensors are written in the
//! model's canonical parameter order, so a load reproduces every weight bit
//! for bit.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{InferirError, Result};
use crate::model::{ModelConfig, ModelWeights};
use crate::tensor::{element_count, Tensor};

/// File magic
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"INFC";

/// Current format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Largest JSON header accepted
const MAX_HEADER_LEN: u64 = 1 << 24;

/// Tensors have at most this many dimensions
const MAX_DIMS: u32 = 8;

/// JSON header of a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointHeader {
    /// Format version (mirrors the binary tag)
    pub format_version: u32,
    /// Model hyperparameters
    pub config: ModelConfig,
    /// Parameter names in stored order
    pub tensor_names: Vec<String>,
}

/// Serialize weights into `w`
///
/// # Errors
///
/// Returns `Io`/`Json` on write failure and `Format` if a packed weight
/// cannot be dequantized
pub fn write_checkpoint<W: Write>(weights: &ModelWeights, w: &mut W) -> Result<()> {
    let params = weights.parameters()?;
    let header = CheckpointHeader {
        format_version: CHECKPOINT_VERSION,
        config: weights.config.clone(),
        tensor_names: params.iter().map(|(n, _)| n.clone()).collect(),
    };
    let json = serde_json::to_vec(&header)?;

    w.write_all(&CHECKPOINT_MAGIC)?;
    w.write_all(&CHECKPOINT_VERSION.to_le_bytes())?;
    w.write_all(&(json.len() as u64).to_le_bytes())?;
    w.write_all(&json)?;
    w.write_all(&(params.len() as u64).to_le_bytes())?;
    for (_, tensor) in &params {
        let ndims = u32::try_from(tensor.ndim())
            .map_err(|_| InferirError::validation("Tensor rank exceeds u32"))?;
        w.write_all(&ndims.to_le_bytes())?;
        for &d in tensor.shape() {
            w.write_all(&(d as u64).to_le_bytes())?;
        }
        for v in tensor.data() {
            w.write_all(&v.to_le_bytes())?;
        }
    }
    w.flush()?;
    Ok(())
}

/// Save weights to a file
///
/// # Errors
///
/// See [`write_checkpoint`]
pub fn save_checkpoint<P: AsRef<Path>>(weights: &ModelWeights, path: P) -> Result<()> {
    let mut w = BufWriter::new(File::create(path.as_ref())?);
    write_checkpoint(weights, &mut w)?;
    info!(path = %path.as_ref().display(), parameters = weights.parameter_count(), "Checkpoint saved");
    Ok(())
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                InferirError::format(format!(
                    "Truncated checkpoint reading {what} at offset {}",
                    self.pos
                ))
            })?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4, what)?);
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8, what)?);
        Ok(u64::from_le_bytes(b))
    }

    fn usize(&mut self, what: &str) -> Result<usize> {
        let v = self.u64(what)?;
        usize::try_from(v).map_err(|_| InferirError::format(format!("{what} {v} overflows usize")))
    }
}

/// Header and raw tensors of a checkpoint image
///
/// # Errors
///
/// Returns `Format` for a bad magic or version, an unreadable header, or
/// truncated tensor data
pub fn read_checkpoint_parts(data: &[u8]) -> Result<(CheckpointHeader, Vec<Tensor>)> {
    let mut r = Reader { data, pos: 0 };
    if r.take(4, "magic")? != CHECKPOINT_MAGIC {
        return Err(InferirError::format("Not a checkpoint (bad magic)"));
    }
    let version = r.u32("version")?;
    if version != CHECKPOINT_VERSION {
        return Err(InferirError::format(format!(
            "Unsupported checkpoint version {version} (expected {CHECKPOINT_VERSION})"
        )));
    }
    let header_len = r.u64("header length")?;
    if header_len > MAX_HEADER_LEN {
        return Err(InferirError::format(format!(
            "Checkpoint header of {header_len} bytes exceeds {MAX_HEADER_LEN}"
        )));
    }
    let header: CheckpointHeader = serde_json::from_slice(r.take(header_len as usize, "header")?)
        .map_err(|e| InferirError::format(format!("Checkpoint header: {e}")))?;

    let count = r.usize("tensor count")?;
    let mut tensors = Vec::with_capacity(count.min(4096));
    for i in 0..count {
        let ndims = r.u32("ndims")?;
        if ndims == 0 || ndims > MAX_DIMS {
            return Err(InferirError::format(format!("Tensor {i} has {ndims} dims")));
        }
        let shape = (0..ndims)
            .map(|_| r.usize("dim"))
            .collect::<Result<Vec<_>>>()?;
        let n = element_count(&shape)
            .map_err(|e| InferirError::format(format!("Tensor {i}: {e}")))?;
        let bytes = r.take(n * 4, "tensor data")?;
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        tensors.push(Tensor::from_vec(shape, values)?);
    }
    if r.pos != data.len() {
        return Err(InferirError::format(format!(
            "{} trailing bytes after checkpoint tensors",
            data.len() - r.pos
        )));
    }
    Ok((header, tensors))
}

/// Rebuild weights from a checkpoint image
///
/// # Errors
///
/// Returns `Format` as for [`read_checkpoint_parts`], or if the tensor count
/// or any tensor's shape disagrees with the stored hyperparameters
pub fn read_checkpoint(data: &[u8]) -> Result<ModelWeights> {
    let (header, tensors) = read_checkpoint_parts(data)?;
    ModelWeights::from_parameters(header.config, tensors)
}

/// Load weights from a checkpoint file
///
/// # Errors
///
/// Returns `Io` if the file cannot be read and `Format` as for
/// [`read_checkpoint`]
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<ModelWeights> {
    let data = std::fs::read(path.as_ref())?;
    let weights = read_checkpoint(&data)?;
    info!(path = %path.as_ref().display(), parameters = weights.parameter_count(), "Checkpoint loaded");
    Ok(weights)
}

/// Load a checkpoint that must match an expected model
///
/// # Errors
///
/// Returns `Format` if the stored hyperparameters differ from `expected`,
/// plus everything [`load_checkpoint`] returns
pub fn load_checkpoint_for<P: AsRef<Path>>(path: P, expected: &ModelConfig) -> Result<ModelWeights> {
    let data = std::fs::read(path.as_ref())?;
    let (header, tensors) = read_checkpoint_parts(&data)?;
    if &header.config != expected {
        return Err(InferirError::format(format!(
            "Checkpoint is for a different model ({} x{} layers, expected {} x{} layers)",
            header.config.architecture,
            header.config.num_layers,
            expected.architecture,
            expected.num_layers
        )));
    }
    ModelWeights::from_parameters(header.config, tensors)
}
