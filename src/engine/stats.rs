//! Lock-free engine counters

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::OwnedSemaphorePermit;

use crate::session::SessionState;

/// Point-in-time view of engine activity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Concurrency bound
    pub max_sessions: usize,
    /// Sessions holding a slot
    pub active_sessions: usize,
    /// Slots free right now
    pub available_slots: usize,
    /// Sessions admitted since start
    pub sessions_started: u64,
    /// Sessions that ended `Completed`
    pub sessions_completed: u64,
    /// Sessions that ended in any other state
    pub sessions_failed: u64,
    /// Tokens produced across all sessions
    pub tokens_generated: u64,
    /// Time since the engine was created
    pub uptime: Duration,
    /// `tokens_generated` over `uptime`
    pub tokens_per_second: f64,
}

#[derive(Debug)]
pub(crate) struct Counters {
    active: AtomicUsize,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    tokens: AtomicU64,
    start_time: Instant,
}

impl Counters {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            tokens: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn add_tokens(&self, n: usize) {
        self.tokens.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn snapshot(&self, max_sessions: usize, available_slots: usize) -> EngineStats {
        let uptime = self.start_time.elapsed();
        let tokens_generated = self.tokens.load(Ordering::Relaxed);
        let secs = uptime.as_secs_f64();
        EngineStats {
            max_sessions,
            active_sessions: self.active.load(Ordering::Relaxed),
            available_slots,
            sessions_started: self.started.load(Ordering::Relaxed),
            sessions_completed: self.completed.load(Ordering::Relaxed),
            sessions_failed: self.failed.load(Ordering::Relaxed),
            tokens_generated,
            uptime,
            tokens_per_second: if secs > 0.0 {
                tokens_generated as f64 / secs
            } else {
                0.0
            },
        }
    }
}

/// One admitted session's hold on the engine
///
/// Dropping it frees the semaphore slot and files the session's outcome.
#[derive(Debug)]
pub(crate) struct SessionSlot {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
    outcome: Option<SessionState>,
}

impl SessionSlot {
    pub(crate) fn new(permit: OwnedSemaphorePermit, counters: Arc<Counters>) -> Self {
        counters.active.fetch_add(1, Ordering::Relaxed);
        counters.started.fetch_add(1, Ordering::Relaxed);
        Self {
            _permit: permit,
            counters,
            outcome: None,
        }
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }

    pub(crate) fn record(&mut self, state: SessionState) {
        self.outcome = Some(state);
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::Relaxed);
        let counter = match self.outcome {
            Some(SessionState::Completed) => &self.counters.completed,
            _ => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
