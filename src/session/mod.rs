//! Governed generation sessions
//!
//! A [`Session`] binds shared model weights to one private KV cache, one
//! seeded sampler and one [`InferenceOptions`] budget. `start` encodes and
//! checks the prompt (no forward pass runs if a budget is already broken)
//! and returns a [`TokenStream`]: a lazy, single-pass iterator that runs
//! one decode step per `next()`.
//!
//! Each step checks, in order: cancellation, wall-clock time, and context
//! budget; then runs the forward pass, rejects non-finite logits, samples
//! and decodes. Terminal states keep every token produced so far; the
//! error behind them is available from [`TokenStream::error`] and
//! [`GenerationOutput::error`].
//!
//! ## Module Structure
//!
//! - `options`: [`InferenceOptions`]
//! - `state`: [`SessionState`], [`FinishReason`], [`CancellationToken`]
//! - `metrics`: [`GenerationMetrics`], [`GeneratedToken`], [`GenerationOutput`]

mod metrics;
mod options;
mod state;

use std::iter::FusedIterator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info_span, trace, warn, Span};

pub use metrics::{GeneratedToken, GenerationMetrics, GenerationOutput};
pub use options::InferenceOptions;
pub use state::{CancellationToken, FinishReason, SessionState};

use crate::attention::KvCache;
use crate::error::{InferirError, ResourceKind, Result};
use crate::generate::Sampler;
use crate::model::Transformer;
use crate::tokenizer::Tokenizer;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One generation request
pub struct Session {
    id: u64,
    transformer: Transformer,
    tokenizer: Arc<dyn Tokenizer>,
    options: InferenceOptions,
    cancel: CancellationToken,
    state: SessionState,
    span: Span,
    cache: Option<KvCache>,
    /// Prompt plus generated tokens the cache may hold
    context_budget: usize,
    sampler: Sampler,
    eos: Option<u32>,
    prompt: Vec<u32>,
    generated: Vec<u32>,
    /// Bytes of a character split across tokens
    pending: Vec<u8>,
    text: String,
    metrics: GenerationMetrics,
    started: Instant,
    last_token_at: Instant,
    finish_reason: Option<FinishReason>,
    error: Option<InferirError>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("prompt_tokens", &self.prompt.len())
            .field("generated", &self.generated.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session over `transformer`
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `options` are out of range
    pub fn new(
        mut transformer: Transformer,
        tokenizer: Arc<dyn Tokenizer>,
        options: InferenceOptions,
    ) -> Result<Self> {
        options.validate()?;
        transformer.enable_kv_cache();
        let config = &transformer.weights().config;
        let eos = config.eos_token_id.or_else(|| tokenizer.end_of_text_id());
        let sampler = Sampler::new(options.sampling(), options.seed);
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        Ok(Self {
            id,
            span: info_span!("session", id),
            transformer,
            tokenizer,
            options,
            cancel: CancellationToken::new(),
            state: SessionState::Created,
            cache: None,
            context_budget: 0,
            sampler,
            eos,
            prompt: Vec::new(),
            generated: Vec::new(),
            pending: Vec::new(),
            text: String::new(),
            metrics: GenerationMetrics::default(),
            started: now,
            last_token_at: now,
            finish_reason: None,
            error: None,
        })
    }

    /// Observe cancellation from `token` instead of a private one
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Process-unique session id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Request budget
    #[must_use]
    pub fn options(&self) -> &InferenceOptions {
        &self.options
    }

    /// Handle that cancels this session
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Encode `prompt` and begin generating
    ///
    /// # Errors
    ///
    /// - `Validation` if the prompt cannot be encoded or encodes to nothing
    /// - `ResourceLimit` if the prompt exceeds `max_input_tokens` (and
    ///   truncation is off) or the context budget; no forward pass has run
    pub fn start(mut self, prompt: &str) -> Result<TokenStream> {
        self.started = Instant::now();
        let span = self.span.clone();
        let _enter = span.enter();
        self.transition(SessionState::Validating);
        match self.tokenizer.encode(prompt) {
            Ok(tokens) => self.begin(tokens),
            Err(e) => {
                self.transition(SessionState::Failed);
                Err(e)
            },
        }
    }

    /// Begin generating from already-encoded prompt tokens
    ///
    /// # Errors
    ///
    /// See [`Session::start`]; also `Validation` for ids outside the model's
    /// vocabulary
    pub fn start_tokens(mut self, tokens: Vec<u32>) -> Result<TokenStream> {
        self.started = Instant::now();
        let span = self.span.clone();
        let _enter = span.enter();
        self.transition(SessionState::Validating);
        self.begin(tokens)
    }

    /// Run to a terminal state and collect the result
    ///
    /// Timeouts, cancellation and mid-generation budget breaches are
    /// reported inside the output alongside the partial tokens.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Session::start`]
    pub fn generate(self, prompt: &str) -> Result<GenerationOutput> {
        Ok(self.start(prompt)?.finish())
    }

    fn transition(&mut self, to: SessionState) {
        debug!(from = %self.state, %to, "Session state");
        self.state = to;
    }

    fn reject(&mut self, state: SessionState, err: InferirError) -> Result<TokenStream> {
        self.transition(state);
        Err(err)
    }

    fn begin(mut self, mut tokens: Vec<u32>) -> Result<TokenStream> {
        let config = &self.transformer.weights().config;
        let (vocab, context_length) = (config.vocab_size, config.context_length);
        if config.add_bos {
            if let Some(bos) = config.bos_token_id {
                if tokens.first() != Some(&bos) {
                    tokens.insert(0, bos);
                }
            }
        }
        if tokens.is_empty() {
            return self.reject(
                SessionState::Failed,
                InferirError::validation("Prompt encodes to no tokens"),
            );
        }

        let limit = self.options.max_input_tokens;
        if tokens.len() > limit {
            if !self.options.truncate_input {
                let actual = tokens.len();
                return self.reject(
                    SessionState::ResourceExceeded,
                    InferirError::ResourceLimit {
                        resource: ResourceKind::InputTokens,
                        limit,
                        actual,
                    },
                );
            }
            warn!(from = tokens.len(), to = limit, "Truncating prompt");
            self.metrics.truncated_tokens = tokens.len() - limit;
            tokens.truncate(limit);
        }

        self.context_budget = self.options.max_context_tokens.min(context_length);
        if tokens.len() > self.context_budget {
            let err = InferirError::ResourceLimit {
                resource: ResourceKind::ContextTokens,
                limit: self.context_budget,
                actual: tokens.len(),
            };
            return self.reject(SessionState::ResourceExceeded, err);
        }
        if let Some(&bad) = tokens.iter().find(|&&id| id as usize >= vocab) {
            return self.reject(
                SessionState::Failed,
                InferirError::validation(format!("Prompt token {bad} outside vocabulary of {vocab}")),
            );
        }

        // The final sampled token is never fed back, so it needs no slot
        let needed = tokens.len().saturating_add(self.options.max_new_tokens - 1);
        let cache = match self.transformer.new_cache(needed.min(self.context_budget)) {
            Ok(c) => c,
            Err(e) => return self.reject(SessionState::Failed, e),
        };
        self.cache = Some(cache);
        self.sampler = Sampler::new(self.options.sampling(), self.options.seed).with_capacity(vocab);
        self.metrics.prompt_tokens = tokens.len();
        self.prompt = tokens;
        // Generation can never outrun the context budget
        self.generated.reserve(self.options.max_new_tokens.min(self.context_budget));
        self.last_token_at = self.started;
        self.transition(SessionState::Generating);
        debug!(
            prompt_tokens = self.prompt.len(),
            max_new_tokens = self.options.max_new_tokens,
            context_budget = self.context_budget,
            "Session started"
        );
        Ok(TokenStream { session: self })
    }

    fn terminate(&mut self, state: SessionState, reason: FinishReason, error: Option<InferirError>) {
        self.transition(state);
        self.finish_reason = Some(reason);
        self.metrics.elapsed = self.started.elapsed();
        if let Some(e) = &error {
            debug!(error = %e, tokens = self.generated.len(), "Session stopped");
        }
        self.error = error;
        if let Some(cache) = self.cache.take() {
            self.transformer.release_cache(cache);
        }
    }

    /// Decoded text completed by `token`
    fn push_text(&mut self, token: u32) -> String {
        if self.tokenizer.token_bytes(token, &mut self.pending).is_err() {
            // Ids the tokenizer does not know contribute no text
            return String::new();
        }
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(s) => s.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                self.text.push_str(&text);
                return text;
            },
        };
        let text = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
        self.pending.drain(..valid);
        self.text.push_str(&text);
        text
    }

    fn is_stop(&self, token: u32) -> bool {
        (self.options.stop_on_eos && Some(token) == self.eos)
            || self.options.stop_tokens.contains(&token)
    }

    fn step(&mut self) -> Option<GeneratedToken> {
        if self.state != SessionState::Generating {
            return None;
        }
        let span = self.span.clone();
        let _enter = span.enter();
        let step = self.generated.len();

        if self.cancel.is_cancelled() {
            let err = InferirError::Cancelled {
                tokens_generated: step,
            };
            self.terminate(SessionState::Cancelled, FinishReason::Cancelled, Some(err));
            return None;
        }
        if let Some(limit_ms) = self.options.max_time_ms {
            let elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
            if elapsed_ms >= limit_ms {
                let err = InferirError::Timeout {
                    elapsed_ms,
                    limit_ms,
                    tokens_generated: step,
                };
                self.terminate(SessionState::TimedOut, FinishReason::TimeLimit, Some(err));
                return None;
            }
        }

        if self.cache.is_none() {
            let err = InferirError::validation("Generating session has no cache");
            self.terminate(SessionState::Failed, FinishReason::Error, Some(err));
            return None;
        }
        let sampled = {
            let cache = self.cache.as_mut()?;
            let input: &[u32] = if step == 0 {
                &self.prompt
            } else {
                &self.generated[step - 1..]
            };
            let requested = cache.len() + input.len();
            if requested > cache.max_seq_len() {
                let err = InferirError::ResourceLimit {
                    resource: ResourceKind::ContextTokens,
                    limit: self.context_budget,
                    actual: requested,
                };
                self.terminate(SessionState::ResourceExceeded, FinishReason::ContextLimit, Some(err));
                return None;
            }
            match self.transformer.forward_cached(input, cache) {
                Ok(logits) => match logits.iter().position(|v| !v.is_finite()) {
                    Some(i) => Err(InferirError::NumericAnomaly {
                        step,
                        reason: format!("logit {i} is {}", logits[i]),
                    }),
                    None => self.sampler.sample(&logits),
                },
                Err(e) => Err(e),
            }
        };

        let token = match sampled {
            Ok(t) => t,
            Err(e) => {
                if matches!(e, InferirError::NumericAnomaly { .. }) {
                    warn!(step, error = %e, "Non-finite logits");
                }
                self.terminate(SessionState::Failed, FinishReason::Error, Some(e));
                return None;
            },
        };

        let now = Instant::now();
        let latency = now.duration_since(self.last_token_at);
        self.last_token_at = now;
        self.generated.push(token);
        self.metrics.record_token(latency, now.duration_since(self.started));
        let text = self.push_text(token);
        trace!(step, token, latency_us = latency.as_micros() as u64, "Decoded token");

        if self.is_stop(token) {
            self.terminate(SessionState::Completed, FinishReason::Stop, None);
        } else if self.generated.len() >= self.options.max_new_tokens {
            self.terminate(SessionState::Completed, FinishReason::Length, None);
        }
        Some(GeneratedToken {
            id: token,
            text,
            metrics: self.metrics,
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Generating {
            let _enter = self.span.enter();
            debug!(tokens = self.generated.len(), "Session dropped mid-generation");
            self.state = SessionState::Cancelled;
        }
        if let Some(cache) = self.cache.take() {
            self.transformer.release_cache(cache);
        }
    }
}

/// Lazy, single-pass stream of generated tokens
///
/// Each `next()` runs one decode step. The stream ends at the first
/// terminal state; it cannot be restarted.
#[derive(Debug)]
pub struct TokenStream {
    session: Session,
}

impl TokenStream {
    /// Session id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.session.id
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.state
    }

    /// Metrics so far
    #[must_use]
    pub fn metrics(&self) -> &GenerationMetrics {
        &self.session.metrics
    }

    /// Prompt as fed to the model
    #[must_use]
    pub fn prompt_tokens(&self) -> &[u32] {
        &self.session.prompt
    }

    /// Tokens generated so far
    #[must_use]
    pub fn tokens(&self) -> &[u32] {
        &self.session.generated
    }

    /// Why generation stopped, once terminal
    #[must_use]
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.session.finish_reason
    }

    /// Error behind a non-`Completed` terminal state
    #[must_use]
    pub fn error(&self) -> Option<&InferirError> {
        self.session.error.as_ref()
    }

    /// Handle that cancels this stream
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.session.cancel.clone()
    }

    /// Run the remaining steps and collect everything
    #[must_use]
    pub fn finish(mut self) -> GenerationOutput {
        while self.session.step().is_some() {}
        let s = &mut self.session;
        if !s.pending.is_empty() {
            let tail = String::from_utf8_lossy(&s.pending).into_owned();
            s.text.push_str(&tail);
            s.pending.clear();
        }
        GenerationOutput {
            tokens: std::mem::take(&mut s.generated),
            text: std::mem::take(&mut s.text),
            state: s.state,
            finish_reason: s.finish_reason.unwrap_or(FinishReason::Error),
            metrics: s.metrics,
            error: s.error.take(),
        }
    }
}

impl Iterator for TokenStream {
    type Item = GeneratedToken;

    fn next(&mut self) -> Option<Self::Item> {
        self.session.step()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.session.state.is_terminal() {
            (0, Some(0))
        } else {
            let left = self.session.options.max_new_tokens.saturating_sub(self.session.generated.len());
            (0, Some(left))
        }
    }
}

impl FusedIterator for TokenStream {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelWeights;
    use crate::pool::BufferPool;
    use crate::testing::{random_weights, tiny_config};
    use crate::tokenizer::ByteTokenizer;

    fn session(options: InferenceOptions) -> Session {
        let weights = Arc::new(random_weights(&tiny_config(), 21));
        session_with(weights, options)
    }

    fn session_with(weights: Arc<ModelWeights>, options: InferenceOptions) -> Session {
        let transformer = Transformer::new(weights, Arc::new(BufferPool::default())).expect("test");
        let tokenizer = ByteTokenizer::with_specials(Some(256), Some(257)).expect("test");
        Session::new(transformer, Arc::new(tokenizer), options).expect("test")
    }

    fn greedy() -> InferenceOptions {
        InferenceOptions::default()
            .greedy()
            .with_stop_on_eos(false)
            .without_time_limit()
    }

    #[test]
    fn test_generates_up_to_max_new_tokens() {
        let out = session(greedy().with_max_new_tokens(5)).generate("hi").expect("test");
        assert_eq!(out.tokens.len(), 5);
        assert_eq!(out.state, SessionState::Completed);
        assert_eq!(out.finish_reason, FinishReason::Length);
        assert!(out.error.is_none());
        assert_eq!(out.metrics.tokens_generated, 5);
        // BOS + "hi"
        assert_eq!(out.metrics.prompt_tokens, 3);
        assert!(out.metrics.time_to_first_token.is_some());
    }

    #[test]
    fn test_stream_is_lazy_and_single_pass() {
        let mut stream = session(greedy().with_max_new_tokens(3)).start("a").expect("test");
        assert_eq!(stream.state(), SessionState::Generating);
        assert!(stream.tokens().is_empty());
        let first = stream.next().expect("test");
        assert_eq!(first.metrics.tokens_generated, 1);
        assert_eq!(stream.by_ref().count(), 2);
        assert!(stream.next().is_none());
        assert_eq!(stream.state(), SessionState::Completed);
    }

    #[test]
    fn test_stop_token_ends_generation() {
        let probe = session(greedy().with_max_new_tokens(1)).generate("x").expect("test");
        let first = probe.tokens[0];
        let out = session(greedy().with_max_new_tokens(10).with_stop_tokens([first]))
            .generate("x")
            .expect("test");
        assert_eq!(out.tokens, vec![first]);
        assert_eq!(out.finish_reason, FinishReason::Stop);
        assert!(out.is_complete());
    }

    #[test]
    fn test_cancel_before_first_step() {
        let stream = session(greedy()).start("abc").expect("test");
        stream.cancellation_token().cancel();
        let out = stream.finish();
        assert_eq!(out.state, SessionState::Cancelled);
        assert!(out.tokens.is_empty());
        assert!(matches!(out.error, Some(InferirError::Cancelled { tokens_generated: 0 })));
    }

    #[test]
    fn test_context_budget_exhaustion_keeps_tokens() {
        // 3 prompt tokens, room for 2 more fed back: 3 tokens come out
        let options = greedy().with_max_context_tokens(5).with_max_new_tokens(20);
        let out = session(options).generate("ab").expect("test");
        assert_eq!(out.tokens.len(), 3);
        assert_eq!(out.state, SessionState::ResourceExceeded);
        assert_eq!(out.finish_reason, FinishReason::ContextLimit);
        assert!(matches!(
            out.error,
            Some(InferirError::ResourceLimit {
                resource: ResourceKind::ContextTokens,
                limit: 5,
                actual: 6
            })
        ));
    }

    #[test]
    fn test_invalid_options_rejected_at_construction() {
        let weights = Arc::new(random_weights(&tiny_config(), 1));
        let transformer = Transformer::new(weights, Arc::new(BufferPool::default())).expect("test");
        let err = Session::new(
            transformer,
            Arc::new(ByteTokenizer::new()),
            InferenceOptions::default().with_top_p(0.0),
        );
        assert!(matches!(err, Err(InferirError::Validation { .. })));
    }

    #[test]
    fn test_cache_returned_to_pool_after_completion() {
        let weights = Arc::new(random_weights(&tiny_config(), 2));
        let pool = Arc::new(BufferPool::default());
        let transformer = Transformer::new(weights, Arc::clone(&pool)).expect("test");
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(ByteTokenizer::new());
        for _ in 0..3 {
            let s = Session::new(transformer.clone(), Arc::clone(&tokenizer), greedy().with_max_new_tokens(4))
                .expect("test");
            let _ = s.generate("warm").expect("test");
        }
        let warm = pool.stats().fresh_allocations;
        let s = Session::new(transformer, tokenizer, greedy().with_max_new_tokens(4)).expect("test");
        let _ = s.generate("warm").expect("test");
        assert_eq!(pool.stats().fresh_allocations, warm);
    }
}
