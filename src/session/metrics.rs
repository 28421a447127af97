//! Generation metrics and results

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::state::{FinishReason, SessionState};
use crate::error::InferirError;

/// Cumulative timing and counts for one generation
///
/// Plain `Copy` data: every streamed token carries a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetrics {
    /// Prompt tokens fed to the model (after truncation, BOS included)
    pub prompt_tokens: usize,
    /// Prompt tokens dropped by truncation
    pub truncated_tokens: usize,
    /// Tokens produced so far
    pub tokens_generated: usize,
    /// Request start to first token
    pub time_to_first_token: Option<Duration>,
    /// Latency of the most recent token
    pub last_token_latency: Option<Duration>,
    /// Slowest token after the first
    pub max_token_latency: Option<Duration>,
    /// Time spent producing tokens after the first
    pub decode_time: Duration,
    /// Request start to the latest update
    pub elapsed: Duration,
}

impl GenerationMetrics {
    /// Record one token produced `latency` after the previous one (or the
    /// request start, for the first)
    pub(crate) fn record_token(&mut self, latency: Duration, elapsed: Duration) {
        if self.tokens_generated == 0 {
            self.time_to_first_token = Some(latency);
        } else {
            self.decode_time += latency;
            self.max_token_latency = Some(self.max_token_latency.map_or(latency, |m| m.max(latency)));
        }
        self.tokens_generated += 1;
        self.last_token_latency = Some(latency);
        self.elapsed = elapsed;
    }

    /// Mean latency of tokens after the first
    #[must_use]
    pub fn mean_token_latency(&self) -> Option<Duration> {
        let steady = u32::try_from(self.tokens_generated.checked_sub(1)?).ok()?;
        (steady > 0).then(|| self.decode_time / steady)
    }

    /// Generated tokens per second of wall-clock time
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.tokens_generated as f64 / secs
        } else {
            0.0
        }
    }
}

/// One streamed token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedToken {
    /// Token id
    pub id: u32,
    /// Text completed by this token; empty while a multi-byte character is
    /// still partial, and for special tokens
    pub text: String,
    /// Metrics as of this token
    pub metrics: GenerationMetrics,
}

/// Everything a finished session produced
#[derive(Debug)]
pub struct GenerationOutput {
    /// Generated ids (prompt excluded)
    pub tokens: Vec<u32>,
    /// Decoded generated text
    pub text: String,
    /// Terminal state
    pub state: SessionState,
    /// Why generation stopped
    pub finish_reason: FinishReason,
    /// Final metrics
    pub metrics: GenerationMetrics,
    /// The error behind a non-`Completed` state; partial tokens are kept
    /// regardless
    pub error: Option<InferirError>,
}

impl GenerationOutput {
    /// Whether the session completed normally
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == SessionState::Completed
    }
}
