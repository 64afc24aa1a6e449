//! Shared limiter backed by a Redis sorted set.
//!
//! Each identity maps to one sorted set whose members are call timestamps
//! in epoch microseconds, scored by themselves. One atomic transaction per
//! evaluation prunes entries older than the window, counts what is left,
//! records the current call, and reads the timestamps that determine when
//! the window frees up. Every instance pointed at the same server therefore
//! shares one view of the budget.
//!
//! Members are keyed by timestamp alone, so two calls landing in the same
//! microsecond collapse into one set member and count once.

use async_trait::async_trait;
use redis::Client;
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::{Limit, Limiter, LimiterOptions};
use crate::clock;
use crate::error::{FloodgateError, Result};

/// Limiter that keeps windows in a shared Redis store.
#[derive(Debug)]
pub struct RedisLimiter {
    options: LimiterOptions,
    client: Arc<Client>,
}

impl RedisLimiter {
    /// Create a limiter over an existing client.
    pub fn new(options: LimiterOptions, client: Arc<Client>) -> Self {
        Self { options, client }
    }

    /// Create a limiter connecting to the given URL.
    pub fn connect(options: LimiterOptions, url: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| FloodgateError::Config(format!("invalid Redis URL: {}", e)))?;
        Ok(Self::new(options, Arc::new(client)))
    }

    /// Derive the limit from what the transaction observed.
    ///
    /// `count` is the number of calls already inside the window, not
    /// counting the one being recorded. `oldest_in_range` is the call that
    /// has to age out before a full set of `max` calls fits again; it only
    /// exists once the set holds at least `max` members, so a set still
    /// under capacity anchors the reset on its oldest member instead. The
    /// reset is floored to whole seconds.
    fn compute_limit(
        id: &str,
        max: u64,
        window_micros: u64,
        now: u64,
        count: u64,
        oldest: Option<u64>,
        oldest_in_range: Option<u64>,
    ) -> Limit {
        let remaining = if count < max { max - count } else { 0 };
        let anchor = oldest_in_range.or(oldest).unwrap_or(now);
        let reset = ((anchor + window_micros) / 1_000_000) as f64;
        Limit {
            id: id.to_string(),
            total: max,
            remaining,
            reset,
        }
    }
}

#[async_trait]
impl Limiter for RedisLimiter {
    async fn evaluate(&self) -> Result<Limit> {
        let key = self.options.key();
        let max = self.options.max;
        let window = self.options.duration.as_micros() as u64;
        let now = clock::now_micros();
        let start = now.saturating_sub(window);

        trace!(key = %key, "Evaluating limit");

        let mut conn = self.client.get_multiplexed_async_connection().await?;

        // One transaction: prune expired calls, count survivors, record this
        // call, then read the reset anchors. The count deliberately precedes
        // the record, so it reflects calls made before this one.
        let (count, oldest, oldest_in_range): (u64, Vec<u64>, Vec<u64>) = redis::pipe()
            .atomic()
            .zrembyscore(&key, 0, start)
            .ignore()
            .zcard(&key)
            .zadd(&key, now, now)
            .ignore()
            .zrange(&key, 0, 0)
            .zrange(&key, -(max as isize), -(max as isize))
            .pexpire(&key, self.options.duration.as_millis() as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;

        let limit = Self::compute_limit(
            &self.options.id,
            max,
            window,
            now,
            count,
            oldest.first().copied(),
            oldest_in_range.first().copied(),
        );

        if limit.remaining == 0 {
            debug!(key = %key, "Rate limit window exhausted");
        }

        Ok(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const WINDOW: u64 = 60_000_000;
    const T0: u64 = 1_700_000_000_000_000;

    #[test]
    fn test_remaining_counts_prior_calls() {
        let limit = RedisLimiter::compute_limit("a", 10, WINDOW, T0, 0, Some(T0), None);
        assert_eq!(limit.remaining, 10);
        assert_eq!(limit.total, 10);

        let limit = RedisLimiter::compute_limit("a", 10, WINDOW, T0, 3, Some(T0), None);
        assert_eq!(limit.remaining, 7);
    }

    #[test]
    fn test_remaining_zero_at_capacity() {
        let limit = RedisLimiter::compute_limit("a", 10, WINDOW, T0, 10, Some(T0), Some(T0));
        assert_eq!(limit.remaining, 0);

        // Overshoot past capacity still reports zero, never wraps.
        let limit = RedisLimiter::compute_limit("a", 10, WINDOW, T0, 14, Some(T0), Some(T0));
        assert_eq!(limit.remaining, 0);
    }

    #[test]
    fn test_reset_anchors_on_capacity_slot() {
        let oldest = T0;
        let in_range = T0 + 5_000_000;
        let limit =
            RedisLimiter::compute_limit("a", 2, WINDOW, T0, 2, Some(oldest), Some(in_range));
        assert_eq!(limit.reset, ((in_range + WINDOW) / 1_000_000) as f64);
    }

    #[test]
    fn test_reset_falls_back_to_oldest() {
        let limit = RedisLimiter::compute_limit("a", 10, WINDOW, T0 + 1, 1, Some(T0), None);
        assert_eq!(limit.reset, ((T0 + WINDOW) / 1_000_000) as f64);
    }

    #[test]
    fn test_reset_falls_back_to_now() {
        let limit = RedisLimiter::compute_limit("a", 10, WINDOW, T0, 0, None, None);
        assert_eq!(limit.reset, ((T0 + WINDOW) / 1_000_000) as f64);
    }

    #[test]
    fn test_reset_floors_to_whole_seconds() {
        let anchor = 1_700_000_000_999_999u64;
        let limit = RedisLimiter::compute_limit("a", 1, 0, anchor, 0, Some(anchor), None);
        assert_eq!(limit.reset, 1_700_000_000.0);
    }

    // The tests below require a running Redis instance.
    // Run with: docker run -d -p 6379:6379 redis:7-alpine

    fn live_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn live_limiter(id: &str, max: u64, duration: Duration) -> RedisLimiter {
        let options = LimiterOptions::new(id, max, duration, "floodgate-test").unwrap();
        RedisLimiter::connect(options, &live_url()).unwrap()
    }

    async fn cleanup(limiter: &RedisLimiter) {
        let mut conn = limiter
            .client
            .get_multiplexed_async_connection()
            .await
            .unwrap();
        let _: () = redis::AsyncCommands::del(&mut conn, limiter.options.key())
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_live_first_call_has_full_budget() {
        let id = format!("budget-{}", clock::now_micros());
        let limiter = live_limiter(&id, 10, Duration::from_secs(60));

        let limit = limiter.evaluate().await.unwrap();
        assert_eq!(limit.id, id);
        assert_eq!(limit.total, 10);
        assert_eq!(limit.remaining, 10);
        assert!(limit.reset > clock::now_seconds() - 1.0);

        cleanup(&limiter).await;
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_live_calls_burn_budget() {
        let id = format!("burn-{}", clock::now_micros());
        let limiter = live_limiter(&id, 3, Duration::from_secs(60));

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(limiter.evaluate().await.unwrap().remaining);
        }
        assert_eq!(seen, vec![3, 2, 1, 0]);

        cleanup(&limiter).await;
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_live_window_slides() {
        let id = format!("slide-{}", clock::now_micros());
        let limiter = live_limiter(&id, 2, Duration::from_millis(500));

        limiter.evaluate().await.unwrap();
        limiter.evaluate().await.unwrap();
        assert_eq!(limiter.evaluate().await.unwrap().remaining, 0);

        // All recorded calls age out of the window.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(limiter.evaluate().await.unwrap().remaining, 2);

        cleanup(&limiter).await;
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_live_instances_share_budget() {
        let id = format!("shared-{}", clock::now_micros());
        let first = live_limiter(&id, 5, Duration::from_secs(60));
        let second = live_limiter(&id, 5, Duration::from_secs(60));

        first.evaluate().await.unwrap();
        first.evaluate().await.unwrap();
        assert_eq!(second.evaluate().await.unwrap().remaining, 3);

        cleanup(&first).await;
    }

    #[test]
    fn test_connect_rejects_bad_url() {
        let options = LimiterOptions::new("a", 1, Duration::from_secs(1), "limit").unwrap();
        let err = RedisLimiter::connect(options, "not-a-url").unwrap_err();
        assert!(matches!(err, FloodgateError::Config(_)));
    }
}
