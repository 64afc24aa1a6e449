//! Limiter trait for abstracting in-process and shared store implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::{FloodgateError, Result};

/// The outcome of evaluating one call against an identity's window.
#[derive(Debug, Clone, PartialEq)]
pub struct Limit {
    /// The identity this limit applies to
    pub id: String,
    /// Total number of calls allowed per window
    pub total: u64,
    /// Calls left in the current window
    pub remaining: u64,
    /// When the window expires, in fractional Unix epoch seconds
    pub reset: f64,
}

impl Limit {
    /// The reset instant as a calendar timestamp, useful for logging.
    ///
    /// Returns `None` only if the reset value is outside chrono's
    /// representable range.
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros((self.reset * 1_000_000.0) as i64)
    }
}

/// Settings shared by every limiter implementation.
#[derive(Debug, Clone)]
pub struct LimiterOptions {
    /// The identity being limited
    pub id: String,
    /// Maximum number of calls allowed per window
    pub max: u64,
    /// Window length
    pub duration: Duration,
    /// Prefix for store keys
    pub namespace: String,
}

impl LimiterOptions {
    /// Create validated limiter options.
    pub fn new(
        id: impl Into<String>,
        max: u64,
        duration: Duration,
        namespace: impl Into<String>,
    ) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(FloodgateError::Config(
                "limiter requires a non-empty id".to_string(),
            ));
        }
        if max == 0 {
            return Err(FloodgateError::Config(
                "limiter max must be at least 1".to_string(),
            ));
        }
        if duration.is_zero() {
            return Err(FloodgateError::Config(
                "limiter duration must be positive".to_string(),
            ));
        }
        Ok(Self {
            id,
            max,
            duration,
            namespace: namespace.into(),
        })
    }

    /// The store key for this identity, namespaced to avoid collisions
    /// with other users of the same store.
    pub fn key(&self) -> String {
        format!("{}:{}", self.namespace, self.id)
    }
}

/// Trait for limiter implementations.
///
/// This trait abstracts over the in-process [`MemoryLimiter`] and the
/// shared [`RedisLimiter`] so callers can hold either behind one contract.
///
/// [`MemoryLimiter`]: super::MemoryLimiter
/// [`RedisLimiter`]: super::RedisLimiter
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Record one call for the configured identity and report the
    /// window state after it.
    ///
    /// An exhausted window is not an error: it comes back as an `Ok`
    /// limit with `remaining` at zero. Errors mean the store itself
    /// could not be consulted.
    async fn evaluate(&self) -> Result<Limit>;
}
