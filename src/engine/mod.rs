//! Bounded-concurrency inference engine
//!
//! One engine owns one set of immutable weights, one scratch pool and a
//! counting semaphore sized to `max_concurrent_sessions`. Every request
//! takes a slot, builds an isolated [`Session`] (own cache, own RNG) and
//! gives the slot back when the session ends or is dropped.
//!
//! Decode loops are CPU-bound, so the async entry points run them on
//! tokio's blocking pool. [`InferenceEngine::stream`] forwards tokens over a
//! bounded channel; dropping the returned [`EngineStream`] cancels the
//! session at its next step.

mod stats;

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

pub use stats::EngineStats;
use stats::{Counters, SessionSlot};

use crate::config::EngineConfig;
use crate::error::{InferirError, ResourceKind, Result};
use crate::gguf::MappedGguf;
use crate::model::{ModelWeights, Transformer};
use crate::pool::BufferPool;
use crate::session::{
    CancellationToken, GeneratedToken, GenerationOutput, InferenceOptions, Session, TokenStream,
};
use crate::tokenizer::{BuiltinTokenizer, Tokenizer};

/// Tokens buffered between a decode loop and its async consumer
const STREAM_BUFFER: usize = 16;

/// Multiplexes sessions over shared weights
pub struct InferenceEngine {
    transformer: Transformer,
    tokenizer: Arc<dyn Tokenizer>,
    config: EngineConfig,
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("architecture", &self.transformer.weights().config.architecture)
            .field("max_sessions", &self.config.max_concurrent_sessions)
            .field("available_slots", &self.semaphore.available_permits())
            .finish_non_exhaustive()
    }
}

impl InferenceEngine {
    /// Build an engine over loaded weights
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `config` is invalid or the tokenizer can
    /// produce ids the model cannot embed
    pub fn new(
        weights: Arc<ModelWeights>,
        tokenizer: Arc<dyn Tokenizer>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let vocab = weights.config.vocab_size;
        if tokenizer.vocab_size() > vocab {
            return Err(InferirError::validation(format!(
                "Tokenizer vocabulary {} exceeds model vocabulary {vocab}",
                tokenizer.vocab_size()
            )));
        }
        let pool = Arc::new(BufferPool::new(config.pool));
        let transformer =
            Transformer::new(weights, pool)?.with_parallel_threshold(config.parallel_threshold);
        info!(
            architecture = %transformer.weights().config.architecture,
            max_sessions = config.max_concurrent_sessions,
            parallel_threshold = config.parallel_threshold,
            "Inference engine ready"
        );
        Ok(Self {
            transformer,
            tokenizer,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_sessions)),
            counters: Arc::new(Counters::new()),
            config,
        })
    }

    /// Load a GGUF model and its built-in tokenizer
    ///
    /// # Errors
    ///
    /// Returns `Io`/`Format` from loading and `Validation` as for
    /// [`InferenceEngine::new`]
    pub fn load<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Self> {
        let container = MappedGguf::open(path.as_ref())?;
        let weights = ModelWeights::from_gguf(&container, config.load)?;
        let tokenizer = BuiltinTokenizer::from_gguf(&container.file)?;
        Self::new(Arc::new(weights), Arc::new(tokenizer), config)
    }

    /// Engine settings
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared weights
    #[must_use]
    pub fn weights(&self) -> &Arc<ModelWeights> {
        self.transformer.weights()
    }

    /// Shared tokenizer
    #[must_use]
    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    /// Shared scratch pool
    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        self.transformer.pool()
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot(
            self.config.max_concurrent_sessions,
            self.semaphore.available_permits(),
        )
    }

    fn admit(&self, slot: SessionSlot, options: InferenceOptions) -> Result<EngineSession> {
        let session = Session::new(self.transformer.clone(), Arc::clone(&self.tokenizer), options)?;
        debug!(session = session.id(), "Session admitted");
        Ok(EngineSession { session, slot })
    }

    /// Take a slot without waiting
    ///
    /// # Errors
    ///
    /// - `ResourceLimit` (`ConcurrentSessions`) if every slot is taken
    /// - `Validation` for invalid options
    pub fn try_session(&self, options: InferenceOptions) -> Result<EngineSession> {
        let permit = Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => InferirError::ResourceLimit {
                    resource: ResourceKind::ConcurrentSessions,
                    limit: self.config.max_concurrent_sessions,
                    actual: self.config.max_concurrent_sessions.saturating_add(1),
                },
                TryAcquireError::Closed => InferirError::validation("Engine is shut down"),
            })?;
        self.admit(SessionSlot::new(permit, Arc::clone(&self.counters)), options)
    }

    /// Wait for a slot
    ///
    /// # Errors
    ///
    /// Returns `Validation` for invalid options
    pub async fn session(&self, options: InferenceOptions) -> Result<EngineSession> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| InferirError::validation("Engine is shut down"))?;
        self.admit(SessionSlot::new(permit, Arc::clone(&self.counters)), options)
    }

    /// Wait for a slot, generate to completion on the blocking pool
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Session::start`]; mid-generation stops are
    /// reported in the output
    pub async fn generate(
        &self,
        prompt: impl Into<String>,
        options: InferenceOptions,
    ) -> Result<GenerationOutput> {
        let session = self.session(options).await?;
        let prompt = prompt.into();
        join(tokio::task::spawn_blocking(move || session.generate(&prompt))).await
    }

    /// Wait for a slot and stream tokens as they are produced
    ///
    /// The stream yields `Ok` tokens, then one `Err` if the session ended in
    /// anything but `Completed`.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Session::start`] before any token is produced
    pub async fn stream(
        &self,
        prompt: impl Into<String>,
        options: InferenceOptions,
    ) -> Result<EngineStream> {
        let session = self.session(options).await?;
        let prompt = prompt.into();
        let mut tokens = session.start(&prompt)?;
        let cancel = tokens.cancellation_token();
        let producer_cancel = cancel.clone();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::task::spawn_blocking(move || {
            for token in tokens.by_ref() {
                if tx.blocking_send(Ok(token)).is_err() {
                    // Consumer went away
                    producer_cancel.cancel();
                    break;
                }
            }
            let output = tokens.finish();
            if let Some(e) = output.error {
                let _ = tx.blocking_send(Err(e));
            }
        });

        Ok(EngineStream {
            inner: ReceiverStream::new(rx),
            cancel,
        })
    }
}

async fn join(handle: JoinHandle<Result<GenerationOutput>>) -> Result<GenerationOutput> {
    match handle.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(InferirError::Cancelled {
            tokens_generated: 0,
        }),
    }
}

/// A session holding an engine slot
#[derive(Debug)]
pub struct EngineSession {
    session: Session,
    slot: SessionSlot,
}

impl EngineSession {
    /// Session id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.session.id()
    }

    /// Handle that cancels this session
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.session.cancellation_token()
    }

    /// Encode `prompt` and begin generating
    ///
    /// # Errors
    ///
    /// See [`Session::start`]
    pub fn start(self, prompt: &str) -> Result<EngineTokenStream> {
        let Self { session, slot } = self;
        let inner = session.start(prompt)?;
        Ok(EngineTokenStream {
            inner,
            slot,
            counted: 0,
        })
    }

    /// Run to a terminal state on the current thread
    ///
    /// # Errors
    ///
    /// See [`Session::start`]
    pub fn generate(self, prompt: &str) -> Result<GenerationOutput> {
        Ok(self.start(prompt)?.finish())
    }
}

/// [`TokenStream`] that reports into engine statistics
#[derive(Debug)]
pub struct EngineTokenStream {
    inner: TokenStream,
    slot: SessionSlot,
    counted: usize,
}

impl EngineTokenStream {
    /// Underlying session stream
    #[must_use]
    pub fn session(&self) -> &TokenStream {
        &self.inner
    }

    /// Handle that cancels this stream
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation_token()
    }

    /// Run the remaining steps and collect everything
    #[must_use]
    pub fn finish(self) -> GenerationOutput {
        let Self {
            inner,
            mut slot,
            counted,
        } = self;
        let output = inner.finish();
        slot.counters().add_tokens(output.tokens.len() - counted);
        slot.record(output.state);
        output
    }
}

impl Iterator for EngineTokenStream {
    type Item = GeneratedToken;

    fn next(&mut self) -> Option<Self::Item> {
        let token = self.inner.next();
        if token.is_some() {
            self.counted += 1;
            self.slot.counters().add_tokens(1);
        }
        self.slot.record(self.inner.state());
        token
    }
}

/// Async token stream from [`InferenceEngine::stream`]
///
/// Dropping it cancels the producing session.
#[derive(Debug)]
pub struct EngineStream {
    inner: ReceiverStream<Result<GeneratedToken>>,
    cancel: CancellationToken,
}

impl EngineStream {
    /// Handle that cancels the producing session
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for EngineStream {
    type Item = Result<GeneratedToken>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for EngineStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
