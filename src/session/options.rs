//! Per-request resource budget

use serde::{Deserialize, Serialize};

use crate::error::{InferirError, Result};
use crate::generate::SamplingConfig;

/// Resource governance and sampling for one generation
///
/// Immutable once a session starts. Limits are in tokens except
/// `max_time_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceOptions {
    /// Largest prompt accepted (BOS included)
    pub max_input_tokens: usize,
    /// Prompt plus generated tokens held in the cache
    pub max_context_tokens: usize,
    /// Tokens the decode loop may produce
    pub max_new_tokens: usize,
    /// Wall-clock budget; `None` = unlimited
    pub max_time_ms: Option<u64>,
    /// Truncate an oversized prompt instead of rejecting it
    pub truncate_input: bool,
    /// Softmax temperature; 0 selects greedy decoding
    pub temperature: f32,
    /// Top-k cutoff (0 = off)
    pub top_k: usize,
    /// Nucleus cutoff (1.0 = off)
    pub top_p: f32,
    /// Seed for reproducible sampling; `None` seeds from OS entropy
    pub seed: Option<u64>,
    /// Stop after the model's end-of-sequence token
    pub stop_on_eos: bool,
    /// Additional ids that end generation
    pub stop_tokens: Vec<u32>,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            max_input_tokens: 1024,
            max_context_tokens: 2048,
            max_new_tokens: 128,
            max_time_ms: Some(60_000),
            truncate_input: false,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            seed: None,
            stop_on_eos: true,
            stop_tokens: Vec::new(),
        }
    }
}

impl InferenceOptions {
    /// Set the new-token budget
    #[must_use]
    pub fn with_max_new_tokens(mut self, n: usize) -> Self {
        self.max_new_tokens = n;
        self
    }

    /// Set the prompt budget
    #[must_use]
    pub fn with_max_input_tokens(mut self, n: usize) -> Self {
        self.max_input_tokens = n;
        self
    }

    /// Set the context budget
    #[must_use]
    pub fn with_max_context_tokens(mut self, n: usize) -> Self {
        self.max_context_tokens = n;
        self
    }

    /// Set the wall-clock budget
    #[must_use]
    pub fn with_max_time_ms(mut self, ms: u64) -> Self {
        self.max_time_ms = Some(ms);
        self
    }

    /// Remove the wall-clock budget
    #[must_use]
    pub fn without_time_limit(mut self) -> Self {
        self.max_time_ms = None;
        self
    }

    /// Truncate oversized prompts instead of rejecting them
    #[must_use]
    pub fn with_truncate_input(mut self, truncate: bool) -> Self {
        self.truncate_input = truncate;
        self
    }

    /// Set the temperature
    #[must_use]
    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    /// Set top-k
    #[must_use]
    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    /// Set top-p
    #[must_use]
    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    /// Fix the sampling seed
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Argmax decoding
    #[must_use]
    pub fn greedy(mut self) -> Self {
        self.temperature = 0.0;
        self.top_k = 1;
        self
    }

    /// Whether EOS ends generation
    #[must_use]
    pub fn with_stop_on_eos(mut self, stop: bool) -> Self {
        self.stop_on_eos = stop;
        self
    }

    /// Add ids that end generation
    #[must_use]
    pub fn with_stop_tokens(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.stop_tokens.extend(ids);
        self
    }

    /// Sampling parameters
    #[must_use]
    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
        }
    }

    /// Check budgets and sampling ranges
    ///
    /// # Errors
    ///
    /// Returns `Validation` naming the first offending field
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_input_tokens", self.max_input_tokens),
            ("max_context_tokens", self.max_context_tokens),
            ("max_new_tokens", self.max_new_tokens),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(InferirError::validation(format!("{name} must be > 0")));
            }
        }
        if self.max_time_ms == Some(0) {
            return Err(InferirError::validation("max_time_ms must be > 0"));
        }
        self.sampling().validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let o = InferenceOptions::default()
            .with_max_new_tokens(7)
            .with_seed(3)
            .with_temperature(0.5)
            .with_top_k(5)
            .with_top_p(0.9)
            .with_max_time_ms(100)
            .with_truncate_input(true)
            .with_stop_tokens([9, 10]);
        assert_eq!(o.max_new_tokens, 7);
        assert_eq!(o.seed, Some(3));
        assert_eq!(o.max_time_ms, Some(100));
        assert!(o.truncate_input);
        assert_eq!(o.stop_tokens, vec![9, 10]);
        o.validate().expect("test");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let base = InferenceOptions::default();
        assert!(base.clone().with_max_new_tokens(0).validate().is_err());
        assert!(base.clone().with_max_time_ms(0).validate().is_err());
        assert!(base.clone().with_top_p(1.5).validate().is_err());
        assert!(base.with_temperature(-0.1).validate().is_err());
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let o: InferenceOptions = serde_json::from_str(r#"{"max_new_tokens": 5, "seed": 1}"#).expect("test");
        assert_eq!(o.max_new_tokens, 5);
        assert_eq!(o.seed, Some(1));
        assert_eq!(o.max_input_tokens, InferenceOptions::default().max_input_tokens);
    }
}
