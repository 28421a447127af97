//! Key-Value cache for autoregressive generation
//!
//! One flat arena per layer, sized `max_seq_len × kv_dim` at construction
//! and never resized. Appends are monotonic: the write position is always the
//! layer's current length, so positions cannot be skipped or overwritten
//! without an explicit [`KvCache::reset`]. A cache is owned by exactly one
//! session; all mutation goes through `&mut self`.

use crate::error::{InferirError, Result};
use crate::pool::BufferPool;
use crate::tensor::MAX_ELEMENTS;

/// Fill state of one layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Nothing cached
    Empty,
    /// Between 1 and `max_seq_len - 1` positions
    Growing,
    /// Exactly `max_seq_len` positions; further appends fail
    Full,
}

/// Per-layer key/value arenas
///
/// # Example
///
/// ```
/// use inferir::attention::{CacheState, KvCache};
///
/// let mut cache = KvCache::new(2, 4, 8).unwrap();
/// cache.append(0, &[0.1; 4], &[0.2; 4]).unwrap();
/// cache.append(1, &[0.1; 4], &[0.2; 4]).unwrap();
/// assert_eq!(cache.len(), 1);
/// assert_eq!(cache.state(0), CacheState::Growing);
/// ```
#[derive(Debug)]
pub struct KvCache {
    /// Keys: `[num_layers][max_seq_len * kv_dim]`
    keys: Vec<Vec<f32>>,
    /// Values: same layout as keys
    values: Vec<Vec<f32>>,
    /// Positions cached per layer
    lens: Vec<usize>,
    max_seq_len: usize,
    kv_dim: usize,
}

fn arena_len(num_layers: usize, kv_dim: usize, max_seq_len: usize) -> Result<usize> {
    if num_layers == 0 || kv_dim == 0 || max_seq_len == 0 {
        return Err(InferirError::validation(format!(
            "KV cache dimensions must be non-zero: layers {num_layers}, kv_dim {kv_dim}, max_seq_len {max_seq_len}"
        )));
    }
    max_seq_len
        .checked_mul(kv_dim)
        .filter(|&n| n <= MAX_ELEMENTS)
        .ok_or_else(|| {
            InferirError::validation(format!(
                "KV cache arena {max_seq_len}x{kv_dim} exceeds the tensor index space"
            ))
        })
}

impl KvCache {
    /// Allocate a cache on the heap
    ///
    /// # Errors
    ///
    /// Returns `Validation` if any dimension is zero or the arena is too large
    pub fn new(num_layers: usize, kv_dim: usize, max_seq_len: usize) -> Result<Self> {
        let n = arena_len(num_layers, kv_dim, max_seq_len)?;
        Ok(Self {
            keys: (0..num_layers).map(|_| vec![0.0; n]).collect(),
            values: (0..num_layers).map(|_| vec![0.0; n]).collect(),
            lens: vec![0; num_layers],
            max_seq_len,
            kv_dim,
        })
    }

    /// Allocate a cache whose arenas come from `pool`
    ///
    /// Pair with [`KvCache::release_into`] so the arenas are reused by the
    /// next session.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if any dimension is zero or the arena is too large
    pub fn from_pool(
        pool: &BufferPool,
        num_layers: usize,
        kv_dim: usize,
        max_seq_len: usize,
    ) -> Result<Self> {
        let n = arena_len(num_layers, kv_dim, max_seq_len)?;
        Ok(Self {
            keys: (0..num_layers).map(|_| pool.rent_vec(n)).collect(),
            values: (0..num_layers).map(|_| pool.rent_vec(n)).collect(),
            lens: vec![0; num_layers],
            max_seq_len,
            kv_dim,
        })
    }

    /// Append `rows` positions (`k.len() / kv_dim`) to one layer
    ///
    /// # Errors
    ///
    /// - `ShapeMismatch` if `k`/`v` are not whole rows of equal length or the
    ///   layer does not exist
    /// - `Capacity` if the layer would exceed `max_seq_len`; nothing is
    ///   written in that case
    pub fn append(&mut self, layer: usize, k: &[f32], v: &[f32]) -> Result<()> {
        if layer >= self.lens.len() {
            return Err(InferirError::shape(format!(
                "Layer {layer} out of range for {}-layer cache",
                self.lens.len()
            )));
        }
        if k.len() != v.len() || k.len() % self.kv_dim != 0 {
            return Err(InferirError::shape(format!(
                "KV append of {} keys / {} values is not whole rows of {}",
                k.len(),
                v.len(),
                self.kv_dim
            )));
        }
        let rows = k.len() / self.kv_dim;
        let len = self.lens[layer];
        let requested = len + rows;
        if requested > self.max_seq_len {
            return Err(InferirError::Capacity {
                layer,
                capacity: self.max_seq_len,
                requested,
            });
        }
        let start = len * self.kv_dim;
        let end = requested * self.kv_dim;
        self.keys[layer][start..end].copy_from_slice(k);
        self.values[layer][start..end].copy_from_slice(v);
        self.lens[layer] = requested;
        Ok(())
    }

    /// Cached keys of a layer: `[layer_len, kv_dim]`
    #[must_use]
    pub fn keys(&self, layer: usize) -> &[f32] {
        &self.keys[layer][..self.lens[layer] * self.kv_dim]
    }

    /// Cached values of a layer: `[layer_len, kv_dim]`
    #[must_use]
    pub fn values(&self, layer: usize) -> &[f32] {
        &self.values[layer][..self.lens[layer] * self.kv_dim]
    }

    /// Positions cached in every layer
    #[must_use]
    pub fn len(&self) -> usize {
        self.lens.iter().copied().min().unwrap_or(0)
    }

    /// Whether no position is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Positions cached in one layer
    #[must_use]
    pub fn layer_len(&self, layer: usize) -> usize {
        self.lens[layer]
    }

    /// Whether every layer holds the same number of positions
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.lens.windows(2).all(|w| w[0] == w[1])
    }

    /// Fill state of one layer
    #[must_use]
    pub fn state(&self, layer: usize) -> CacheState {
        match self.lens[layer] {
            0 => CacheState::Empty,
            n if n == self.max_seq_len => CacheState::Full,
            _ => CacheState::Growing,
        }
    }

    /// Positions still available
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.max_seq_len - self.lens.iter().copied().max().unwrap_or(0)
    }

    /// Fixed capacity in positions
    #[must_use]
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Number of layers
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.lens.len()
    }

    /// Width of one cached row (`num_kv_heads * head_dim`)
    #[must_use]
    pub fn kv_dim(&self) -> usize {
        self.kv_dim
    }

    /// Forget every position, keeping the arenas
    pub fn reset(&mut self) {
        self.lens.fill(0);
    }

    /// Return the arenas to `pool`
    pub fn release_into(self, pool: &BufferPool) {
        for buf in self.keys.into_iter().chain(self.values) {
            pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;

    #[test]
    fn test_state_transitions() {
        let mut cache = KvCache::new(1, 2, 3).expect("test");
        assert_eq!(cache.state(0), CacheState::Empty);
        cache.append(0, &[1.0, 2.0], &[3.0, 4.0]).expect("test");
        assert_eq!(cache.state(0), CacheState::Growing);
        cache
            .append(0, &[5.0, 6.0, 7.0, 8.0], &[0.0; 4])
            .expect("test");
        assert_eq!(cache.state(0), CacheState::Full);
        assert_eq!(cache.keys(0), &[1.0, 2.0, 5.0, 6.0, 7.0, 8.0]);
        assert_eq!(cache.remaining(), 0);
    }

    #[test]
    fn test_overflow_is_capacity_error_and_writes_nothing() {
        let mut cache = KvCache::new(1, 1, 2).expect("test");
        cache.append(0, &[1.0], &[1.0]).expect("test");
        let err = cache.append(0, &[2.0, 3.0], &[2.0, 3.0]);
        assert!(matches!(
            err,
            Err(InferirError::Capacity {
                layer: 0,
                capacity: 2,
                requested: 3
            })
        ));
        assert_eq!(cache.keys(0), &[1.0]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_shape_errors() {
        let mut cache = KvCache::new(2, 4, 4).expect("test");
        assert!(cache.append(0, &[0.0; 3], &[0.0; 3]).is_err());
        assert!(cache.append(0, &[0.0; 4], &[0.0; 8]).is_err());
        assert!(cache.append(2, &[0.0; 4], &[0.0; 4]).is_err());
        assert!(KvCache::new(0, 4, 4).is_err());
    }

    #[test]
    fn test_len_is_min_over_layers() {
        let mut cache = KvCache::new(2, 1, 4).expect("test");
        cache.append(0, &[1.0], &[1.0]).expect("test");
        assert_eq!(cache.len(), 0);
        assert!(!cache.is_consistent());
        cache.append(1, &[1.0], &[1.0]).expect("test");
        assert_eq!(cache.len(), 1);
        assert!(cache.is_consistent());
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut cache = KvCache::new(1, 1, 2).expect("test");
        cache.append(0, &[1.0, 2.0], &[1.0, 2.0]).expect("test");
        cache.reset();
        assert!(cache.is_empty());
        cache.append(0, &[9.0], &[9.0]).expect("test");
        assert_eq!(cache.keys(0), &[9.0]);
    }

    #[test]
    fn test_pool_round_trip() {
        let pool = BufferPool::new(PoolConfig::default());
        let cache = KvCache::from_pool(&pool, 2, 8, 8).expect("test");
        cache.release_into(&pool);
        let before = pool.stats().fresh_allocations;
        let again = KvCache::from_pool(&pool, 2, 8, 8).expect("test");
        assert_eq!(pool.stats().fresh_allocations, before);
        assert_eq!(again.max_seq_len(), 8);
    }
}
