//! Session lifecycle

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Lifecycle of one generation
///
/// ```text
/// Created → Validating → Generating → Completed
///                     ↘            ↘ TimedOut | ResourceExceeded | Cancelled | Failed
///                       ResourceExceeded | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Options accepted, no prompt yet
    Created,
    /// Encoding the prompt and checking budgets
    Validating,
    /// Decode loop running
    Generating,
    /// Finished normally (length or stop token)
    Completed,
    /// Wall-clock budget ran out
    TimedOut,
    /// A token budget was exceeded
    ResourceExceeded,
    /// Stopped by a cancellation signal
    Cancelled,
    /// Stopped by an error
    Failed,
}

impl SessionState {
    /// Whether no further tokens will be produced
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::TimedOut | Self::ResourceExceeded | Self::Cancelled | Self::Failed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Validating => "validating",
            Self::Generating => "generating",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::ResourceExceeded => "resource_exceeded",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// `max_new_tokens` reached
    Length,
    /// EOS or a configured stop token
    Stop,
    /// Wall-clock budget exhausted
    TimeLimit,
    /// Context budget exhausted
    ContextLimit,
    /// Cancelled by the caller
    Cancelled,
    /// Error during generation
    Error,
}

/// Cooperative cancellation flag shared between a session and its caller
///
/// Checked at the top of every decode step.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A fresh, uncancelled token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
