//! Engine configuration and logging setup
//!
//! [`EngineConfig`] is read from JSON (every field optional) and then
//! overridden from the environment:
//!
//! | Variable | Field |
//! |---|---|
//! | `INFERIR_MAX_SESSIONS` | `max_concurrent_sessions` |
//! | `INFERIR_PARALLEL_THRESHOLD` | `parallel_threshold` |
//! | `INFERIR_LOAD_POLICY` | `load` (`materialize` or `lazy`) |

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::{InferirError, Result};
use crate::kernels::DEFAULT_PARALLEL_THRESHOLD;
use crate::model::LoadPolicy;
use crate::pool::PoolConfig;
use crate::session::InferenceOptions;

/// Environment variable overriding `max_concurrent_sessions`
pub const ENV_MAX_SESSIONS: &str = "INFERIR_MAX_SESSIONS";
/// Environment variable overriding `parallel_threshold`
pub const ENV_PARALLEL_THRESHOLD: &str = "INFERIR_PARALLEL_THRESHOLD";
/// Environment variable overriding `load`
pub const ENV_LOAD_POLICY: &str = "INFERIR_LOAD_POLICY";

/// Default log filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "inferir=info";

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sessions admitted at once
    pub max_concurrent_sessions: usize,
    /// Scratch pool sizing
    pub pool: PoolConfig,
    /// Multiply-add count above which a matmul fans out on rayon
    pub parallel_threshold: usize,
    /// How container weights are held in memory
    pub load: LoadPolicy,
    /// Options used when a request brings none
    pub default_options: InferenceOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: std::thread::available_parallelism().map_or(1, usize::from),
            pool: PoolConfig::default(),
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
            load: LoadPolicy::default(),
            default_options: InferenceOptions::default(),
        }
    }
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| InferirError::validation(format!("{key}={raw:?}: {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(InferirError::validation(format!("{key}: {e}"))),
    }
}

impl EngineConfig {
    /// Parse JSON; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns `Json` for malformed input
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Read and parse a JSON file
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read and `Json` if it does not parse
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Apply `INFERIR_*` environment overrides
    ///
    /// # Errors
    ///
    /// Returns `Validation` if a variable is set but does not parse
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(n) = parse_env(ENV_MAX_SESSIONS)? {
            self.max_concurrent_sessions = n;
        }
        if let Some(n) = parse_env(ENV_PARALLEL_THRESHOLD)? {
            self.parallel_threshold = n;
        }
        if let Some(p) = parse_env(ENV_LOAD_POLICY)? {
            self.load = p;
        }
        Ok(self)
    }

    /// Check ranges
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a session limit of zero or above
    /// [`Semaphore::MAX_PERMITS`], a pool with no size classes, or invalid
    /// default options
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_sessions == 0 {
            return Err(InferirError::validation("max_concurrent_sessions must be > 0"));
        }
        if self.max_concurrent_sessions > Semaphore::MAX_PERMITS {
            return Err(InferirError::validation(format!(
                "max_concurrent_sessions {} exceeds {}",
                self.max_concurrent_sessions,
                Semaphore::MAX_PERMITS
            )));
        }
        if self.pool.min_class_bits > self.pool.max_class_bits {
            return Err(InferirError::validation(format!(
                "pool.min_class_bits {} above pool.max_class_bits {} leaves no size classes",
                self.pool.min_class_bits, self.pool.max_class_bits
            )));
        }
        if self.pool.max_class_bits > 40 {
            return Err(InferirError::validation(format!(
                "pool.max_class_bits {} is unreasonably large",
                self.pool.max_class_bits
            )));
        }
        self.default_options.validate()
    }
}

/// Install the global `tracing` subscriber for the binary
///
/// Reads `RUST_LOG`, falling back to [`DEFAULT_LOG_FILTER`]. Logs go to
/// stderr so generated text on stdout stays clean. A second call is a no-op.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let c = EngineConfig::from_json_str(
            r#"{"max_concurrent_sessions": 3, "load": "lazy", "default_options": {"max_new_tokens": 9}}"#,
        )
        .expect("test");
        assert_eq!(c.max_concurrent_sessions, 3);
        assert_eq!(c.load, LoadPolicy::Lazy);
        assert_eq!(c.default_options.max_new_tokens, 9);
        assert_eq!(c.parallel_threshold, DEFAULT_PARALLEL_THRESHOLD);
        c.validate().expect("test");
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            EngineConfig::from_json_str("{not json"),
            Err(InferirError::Json(_))
        ));
    }

    #[test]
    fn test_validate() {
        let c = EngineConfig {
            max_concurrent_sessions: 0,
            ..EngineConfig::default()
        };
        assert!(c.validate().is_err());

        let c = EngineConfig {
            max_concurrent_sessions: Semaphore::MAX_PERMITS + 1,
            ..EngineConfig::default()
        };
        assert!(matches!(c.validate(), Err(InferirError::Validation { .. })));

        let mut c = EngineConfig {
            max_concurrent_sessions: Semaphore::MAX_PERMITS,
            ..EngineConfig::default()
        };
        c.validate().expect("test");
        c.pool.min_class_bits = c.pool.max_class_bits + 1;
        assert!(matches!(c.validate(), Err(InferirError::Validation { .. })));
    }
}
