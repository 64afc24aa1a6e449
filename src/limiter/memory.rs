//! In-process limiter backed by a concurrent table.
//!
//! Windows are approximated: the first call for an identity opens a window
//! that runs for the full configured duration, and every further call inside
//! it decrements the allowance. Expired entries are not reaped in the
//! background; they are replaced the next time their identity calls, so the
//! table grows with the number of distinct identities seen.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::{Limit, Limiter, LimiterOptions};
use crate::clock;
use crate::error::Result;

/// Shared table of windows, keyed by namespaced identity.
///
/// Cloning is cheap and every clone observes the same windows, so one store
/// can back any number of limiters.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Limit>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the current window for a key.
    pub fn get(&self, key: &str) -> Option<Limit> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Get the number of tracked windows.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether any windows are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all windows.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Limiter that keeps windows in process memory.
#[derive(Debug)]
pub struct MemoryLimiter {
    options: LimiterOptions,
    store: MemoryStore,
}

impl MemoryLimiter {
    /// Create a limiter over the given store.
    pub fn new(options: LimiterOptions, store: MemoryStore) -> Self {
        Self { options, store }
    }

    /// Evaluate one call at an explicit timestamp in epoch microseconds.
    ///
    /// The entry guard pins the key's shard for the whole read-modify-write,
    /// so concurrent calls for one identity serialize instead of clobbering
    /// each other's decrements.
    fn evaluate_at(&self, now: u64) -> Limit {
        let key = self.options.key();

        trace!(key = %key, "Evaluating limit");

        match self.store.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                // A window whose reset has been reached is already over.
                if occupied.get().reset * 1_000_000.0 <= now as f64 {
                    let fresh = self.open_window(now);
                    debug!(key = %key, max = self.options.max, "Starting new rate limit window");
                    occupied.insert(fresh.clone());
                    fresh
                } else {
                    let entry = occupied.get_mut();
                    entry.remaining = entry.remaining.saturating_sub(1);
                    let limit = entry.clone();
                    if limit.remaining == 0 {
                        debug!(key = %key, "Rate limit window exhausted");
                    }
                    limit
                }
            }
            Entry::Vacant(vacant) => {
                let fresh = self.open_window(now);
                debug!(key = %key, max = self.options.max, "Starting new rate limit window");
                vacant.insert(fresh.clone());
                fresh
            }
        }
    }

    /// A full window opened at `now`. The opening call is the one that
    /// created it, so the allowance comes back untouched.
    fn open_window(&self, now: u64) -> Limit {
        let window = self.options.duration.as_micros() as u64;
        Limit {
            id: self.options.id.clone(),
            total: self.options.max,
            remaining: self.options.max,
            reset: (now + window) as f64 / 1_000_000.0,
        }
    }
}

#[async_trait]
impl Limiter for MemoryLimiter {
    async fn evaluate(&self) -> Result<Limit> {
        Ok(self.evaluate_at(clock::now_micros()))
    }
}
