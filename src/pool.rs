//! Scratch-buffer pool for kernels and caches
//!
//! Buffers are bucketed into power-of-two size classes. `rent` hands out a
//! zero-filled buffer of the requested length backed by a class-sized
//! allocation; dropping the returned [`PooledBuffer`] puts the allocation back.
//! Buffers whose capacity is not a standard class size are dropped on return
//! instead of pooled, so irregular one-off allocations never grow the pool.
//!
//! Buckets are sharded per thread (each thread is assigned a shard on first
//! use) so rayon workers renting scratch in parallel rarely contend.
//!
//! The pool is an explicit handle: engines own one and pass it to models and
//! sessions. There is no global instance.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Pool sizing configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum cached buffers per size class per shard
    pub max_buffers_per_class: usize,
    /// Smallest class is `1 << min_class_bits` elements
    pub min_class_bits: u32,
    /// Largest class is `1 << max_class_bits` elements; larger requests are not pooled
    pub max_class_bits: u32,
    /// Number of shards (0 = available parallelism)
    pub shards: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_buffers_per_class: 16,
            min_class_bits: 6,
            max_class_bits: 26,
            shards: 0,
        }
    }
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    /// Total `rent` calls
    pub rents: u64,
    /// Rents served from a cached buffer
    pub hits: u64,
    /// Rents that had to allocate from the heap
    pub fresh_allocations: u64,
    /// Buffers accepted back into the pool
    pub returns: u64,
    /// Buffers dropped on return (non-standard size or full bucket)
    pub discarded: u64,
    /// Buffers currently cached
    pub cached_buffers: usize,
    /// Bytes currently cached
    pub cached_bytes: usize,
}

type Bucket = Mutex<Vec<Vec<f32>>>;

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_HINT: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed);
}

/// Size-classed buffer pool
#[derive(Debug)]
pub struct BufferPool {
    config: PoolConfig,
    /// `shards[shard][class]`
    shards: Vec<Vec<Bucket>>,
    rents: AtomicU64,
    hits: AtomicU64,
    fresh: AtomicU64,
    returns: AtomicU64,
    discarded: AtomicU64,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl BufferPool {
    /// Create a pool with the given configuration
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let min = config.min_class_bits.min(config.max_class_bits);
        let config = PoolConfig {
            min_class_bits: min,
            ..config
        };
        let num_classes = (config.max_class_bits - config.min_class_bits + 1) as usize;
        let num_shards = if config.shards == 0 {
            std::thread::available_parallelism().map_or(1, usize::from)
        } else {
            config.shards
        };
        let shards = (0..num_shards)
            .map(|_| (0..num_classes).map(|_| Mutex::new(Vec::new())).collect())
            .collect();
        Self {
            config,
            shards,
            rents: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            fresh: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Pool configuration
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Class index for a requested length, `None` if beyond the largest class
    fn class_for_len(&self, len: usize) -> Option<usize> {
        let bits = len
            .max(1)
            .next_power_of_two()
            .trailing_zeros()
            .max(self.config.min_class_bits);
        (bits <= self.config.max_class_bits).then(|| (bits - self.config.min_class_bits) as usize)
    }

    /// Class index for a returned buffer, `None` if its capacity is non-standard
    fn class_for_capacity(&self, capacity: usize) -> Option<usize> {
        if !capacity.is_power_of_two() {
            return None;
        }
        let bits = capacity.trailing_zeros();
        (self.config.min_class_bits..=self.config.max_class_bits)
            .contains(&bits)
            .then(|| (bits - self.config.min_class_bits) as usize)
    }

    fn shard(&self) -> &[Bucket] {
        let idx = SHARD_HINT.with(|hint| *hint) % self.shards.len();
        &self.shards[idx]
    }

    /// Take a zero-filled `Vec` of exactly `len` elements, transferring ownership
    ///
    /// Use for long-lived owners (KV caches); hand the buffer back with
    /// [`BufferPool::release`].
    #[must_use]
    pub fn rent_vec(&self, len: usize) -> Vec<f32> {
        self.rents.fetch_add(1, Ordering::Relaxed);
        let Some(class) = self.class_for_len(len) else {
            self.fresh.fetch_add(1, Ordering::Relaxed);
            return vec![0.0; len];
        };

        let cached = self.shard()[class]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let mut buf = if let Some(buf) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            buf
        } else {
            self.fresh.fetch_add(1, Ordering::Relaxed);
            Vec::with_capacity(1 << (class as u32 + self.config.min_class_bits))
        };
        buf.clear();
        buf.resize(len, 0.0);
        buf
    }

    /// Rent a zero-filled scratch buffer of `len` elements
    ///
    /// The buffer returns to the pool when the guard is dropped, including on
    /// early `?` returns.
    #[must_use]
    pub fn rent(&self, len: usize) -> PooledBuffer<'_> {
        PooledBuffer {
            buf: self.rent_vec(len),
            pool: self,
        }
    }

    /// Return a buffer to the pool
    ///
    /// No-op (the buffer is dropped) for non-standard capacities or when the
    /// class bucket is already full.
    pub fn release(&self, buf: Vec<f32>) {
        let Some(class) = self.class_for_capacity(buf.capacity()) else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let mut bucket = self.shard()[class]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if bucket.len() < self.config.max_buffers_per_class {
            bucket.push(buf);
            self.returns.fetch_add(1, Ordering::Relaxed);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop every cached buffer
    pub fn clear(&self) {
        for shard in &self.shards {
            for bucket in shard {
                bucket.lock().unwrap_or_else(PoisonError::into_inner).clear();
            }
        }
    }

    /// Current counters and cache occupancy
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut cached_buffers = 0;
        let mut cached_bytes = 0;
        for shard in &self.shards {
            for bucket in shard {
                let bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
                cached_buffers += bucket.len();
                cached_bytes += bucket
                    .iter()
                    .map(|b| b.capacity() * std::mem::size_of::<f32>())
                    .sum::<usize>();
            }
        }
        PoolStats {
            rents: self.rents.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            fresh_allocations: self.fresh.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            cached_buffers,
            cached_bytes,
        }
    }
}

/// Scratch buffer on loan from a [`BufferPool`]
///
/// Exclusive owner until dropped; derefs to a slice of the requested length.
#[derive(Debug)]
pub struct PooledBuffer<'a> {
    buf: Vec<f32>,
    pool: &'a BufferPool,
}

impl PooledBuffer<'_> {
    /// Detach the buffer from the pool; it will not be returned on drop
    #[must_use]
    pub fn into_vec(mut self) -> Vec<f32> {
        std::mem::take(&mut self.buf)
    }
}

impl Deref for PooledBuffer<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        if buf.capacity() > 0 {
            self.pool.release(buf);
        }
    }
}
