//! Next-token sampling
//!
//! Greedy decoding and temperature / top-k / top-p sampling over one row of
//! logits. The random draw is supplied by the caller as a uniform value in
//! `[0, 1)`, so the sampling functions are pure; [`Sampler`] pairs them with
//! a seedable ChaCha generator owned by one session.
//!
//! Candidate ordering is total (descending logit, then ascending token id),
//! so equal logits never make the result depend on sort stability.

use std::cmp::Ordering;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{InferirError, Result};
use crate::kernels::argmax;

/// Sampling parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Softmax temperature; 0 selects greedy decoding
    pub temperature: f32,
    /// Keep only the `k` most likely tokens (0 = no limit)
    pub top_k: usize,
    /// Keep the smallest prefix whose probability reaches `p` (1.0 = no limit)
    pub top_p: f32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
        }
    }
}

impl SamplingConfig {
    /// Argmax decoding
    #[must_use]
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 1,
            top_p: 1.0,
        }
    }

    /// Whether sampling reduces to argmax
    #[must_use]
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0 || self.top_k == 1
    }

    /// Check parameter ranges
    ///
    /// # Errors
    ///
    /// Returns `Validation` if temperature is negative or not finite, or
    /// `top_p` is outside `(0, 1]`
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(InferirError::validation(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            )));
        }
        if self.top_p.is_nan() || self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(InferirError::validation(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

fn by_logit_desc(a: &(u32, f32), b: &(u32, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
}

/// Index of the largest logit
///
/// # Errors
///
/// Returns `Validation` if `logits` is empty or entirely NaN
pub fn sample_greedy(logits: &[f32]) -> Result<u32> {
    argmax(logits)
        .map(|i| i as u32)
        .ok_or_else(|| InferirError::validation("Cannot sample from empty logits"))
}

/// Sample one token
///
/// Applies temperature, then top-k, then softmax, then top-p, and picks the
/// token whose cumulative probability first exceeds `rng_value` (scaled to
/// the kept mass). `candidates` is scratch reused across calls.
///
/// # Errors
///
/// Returns `Validation` if `logits` is empty
pub fn sample_with(
    logits: &[f32],
    config: &SamplingConfig,
    rng_value: f32,
    candidates: &mut Vec<(u32, f32)>,
) -> Result<u32> {
    if config.is_greedy() {
        return sample_greedy(logits);
    }
    if logits.is_empty() {
        return Err(InferirError::validation("Cannot sample from empty logits"));
    }

    let inv_t = 1.0 / config.temperature;
    candidates.clear();
    candidates.extend(logits.iter().enumerate().map(|(i, &l)| (i as u32, l * inv_t)));

    if config.top_k > 0 && config.top_k < candidates.len() {
        candidates.select_nth_unstable_by(config.top_k - 1, by_logit_desc);
        candidates.truncate(config.top_k);
    }
    candidates.sort_unstable_by(by_logit_desc);

    let max = candidates[0].1;
    let mut sum = 0.0f32;
    for c in candidates.iter_mut() {
        c.1 = (c.1 - max).exp();
        sum += c.1;
    }
    let inv_sum = 1.0 / sum;
    let mut cumulative = 0.0f32;
    let n = candidates.len();
    let mut keep = n;
    for (i, c) in candidates.iter_mut().enumerate() {
        c.1 *= inv_sum;
        cumulative += c.1;
        if cumulative >= config.top_p && keep == n {
            keep = i + 1;
        }
    }
    candidates.truncate(keep);

    let mass: f32 = candidates.iter().map(|c| c.1).sum();
    let target = rng_value.clamp(0.0, 1.0) * mass;
    let mut acc = 0.0f32;
    for &(id, p) in candidates.iter() {
        acc += p;
        if target < acc {
            return Ok(id);
        }
    }
    Ok(candidates[candidates.len() - 1].0)
}

/// Seeded sampler owned by one session
#[derive(Debug, Clone)]
pub struct Sampler {
    config: SamplingConfig,
    rng: ChaCha8Rng,
    candidates: Vec<(u32, f32)>,
}

impl Sampler {
    /// Create a sampler; `None` seeds from OS entropy
    #[must_use]
    pub fn new(config: SamplingConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            config,
            rng,
            candidates: Vec::new(),
        }
    }

    /// Reserve candidate scratch for a vocabulary
    #[must_use]
    pub fn with_capacity(mut self, vocab_size: usize) -> Self {
        self.candidates.reserve(vocab_size);
        self
    }

    /// Sampling parameters
    #[must_use]
    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Pick the next token
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `logits` is empty
    pub fn sample(&mut self, logits: &[f32]) -> Result<u32> {
        if self.config.is_greedy() {
            return sample_greedy(logits);
        }
        let r: f32 = self.rng.gen();
        sample_with(logits, &self.config, r, &mut self.candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(temperature: f32, top_k: usize, top_p: f32) -> SamplingConfig {
        SamplingConfig {
            temperature,
            top_k,
            top_p,
        }
    }

    #[test]
    fn test_greedy_picks_max_lowest_index_on_tie() {
        assert_eq!(sample_greedy(&[0.1, 0.9, 0.9, 0.2]).expect("test"), 1);
        assert!(sample_greedy(&[]).is_err());
    }

    #[test]
    fn test_top_k_one_is_greedy() {
        let mut c = Vec::new();
        let id = sample_with(&[1.0, 3.0, 2.0], &cfg(0.8, 1, 1.0), 0.99, &mut c).expect("test");
        assert_eq!(id, 1);
    }

    #[test]
    fn test_top_k_restricts_support() {
        let logits = [5.0, 4.0, 3.0, 2.0, 1.0];
        let mut c = Vec::new();
        for i in 0..20 {
            let r = i as f32 / 20.0;
            let id = sample_with(&logits, &cfg(1.0, 2, 1.0), r, &mut c).expect("test");
            assert!(id <= 1);
        }
    }

    #[test]
    fn test_top_p_keeps_smallest_prefix() {
        // p(0) ≈ 0.9999 dominates; top_p 0.5 keeps only token 0
        let logits = [10.0, 0.0, 0.0];
        let mut c = Vec::new();
        let id = sample_with(&logits, &cfg(1.0, 0, 0.5), 0.999, &mut c).expect("test");
        assert_eq!(id, 0);
    }

    #[test]
    fn test_top_p_cut_after_crossing_token() {
        // p ≈ [0.665, 0.245, 0.090, 0.000004]: the cumulative mass crosses 0.9 at token 1
        let logits = [2.0, 1.0, 0.0, -10.0];
        let mut c = Vec::new();
        let id = sample_with(&logits, &cfg(1.0, 0, 0.9), 0.99, &mut c).expect("test");
        assert_eq!(c.len(), 2);
        assert_eq!(id, 1);
    }

    #[test]
    fn test_rng_value_walks_distribution() {
        let logits = [0.0, 0.0];
        let mut c = Vec::new();
        assert_eq!(sample_with(&logits, &cfg(1.0, 0, 1.0), 0.1, &mut c).expect("test"), 0);
        assert_eq!(sample_with(&logits, &cfg(1.0, 0, 1.0), 0.9, &mut c).expect("test"), 1);
    }

    #[test]
    fn test_seeded_sampler_is_deterministic() {
        let logits: Vec<f32> = (0..50).map(|i| (i as f32 * 0.3).sin()).collect();
        let config = cfg(0.9, 10, 0.95);
        let mut a = Sampler::new(config, Some(42));
        let mut b = Sampler::new(config, Some(42));
        let xs: Vec<u32> = (0..32).map(|_| a.sample(&logits).expect("test")).collect();
        let ys: Vec<u32> = (0..32).map(|_| b.sample(&logits).expect("test")).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_validate() {
        cfg(0.7, 40, 0.9).validate().expect("test");
        assert!(cfg(-1.0, 0, 1.0).validate().is_err());
        assert!(cfg(1.0, 0, 0.0).validate().is_err());
        assert!(cfg(1.0, 0, 1.5).validate().is_err());
        assert!(cfg(f32::NAN, 0, 1.0).validate().is_err());
    }
}
