//! Resilience utilities: retry backoff and drain rate limiting.
//!
//! - [`BackoffPolicy`]: per-record exponential backoff between failed applies
//! - [`RateLimiter`]: token bucket so a recovered secondary is not flooded
//!   by the whole backlog at once
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use outbox_mirror::resilience::{BackoffPolicy, RateLimiter, RateLimitConfig};
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(300));
//! assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // Blocks if over limit
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

/// Exponential backoff between failed applies of one outbox record.
///
/// # Schedule (defaults: base 500ms, factor 2, cap 5 minutes)
///
/// ```text
/// Attempts  Delay
/// --------  -----
/// 1         500ms
/// 2         1s
/// 3         2s
/// 4         4s
/// ...
/// 11        256s
/// 12+       300s (cap)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,

    /// Ceiling for the delay.
    pub max: Duration,

    /// Multiplier per additional failure.
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(300),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Doubling backoff from `base`, capped at `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            factor: 2.0,
        }
    }

    /// Delay to wait after the record has failed `attempts` times (1-indexed).
    ///
    /// `min(base * factor^(attempts-1), max)`. Attempt 0 is treated as 1.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base.as_secs_f64() * self.factor.powi(exponent);

        if !delay_secs.is_finite() || delay_secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(delay_secs).min(self.max)
    }

    /// Unix-millis timestamp of the next attempt after failure number `attempts`.
    pub fn next_attempt_at(&self, now_ms: i64, attempts: u32) -> i64 {
        let delay = self.delay_for_attempt(attempts).as_millis().min(i64::MAX as u128) as i64;
        now_ms.saturating_add(delay)
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each applied record consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// Default: 1000 ops/sec with burst of 100.
    fn default() -> Self {
        Self {
            burst_size: 100,
            refill_rate: 1000,
        }
    }
}

/// Token bucket rate limiter.
///
/// Thread-safe and async-aware.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        let limiter = GovLimiter::direct(quota);

        Self { limiter, config }
    }

    /// Acquire a permit, blocking until one is available.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without blocking.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Get the current configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_base() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(300));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(300));

        assert_eq!(policy.delay_for_attempt(12), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(1000), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_attempt_zero_is_base() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), policy.base);
    }

    #[test]
    fn test_next_attempt_at() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.next_attempt_at(10_000, 1), 10_100);
        assert_eq!(policy.next_attempt_at(10_000, 3), 10_400);
        assert_eq!(policy.next_attempt_at(10_000, 50), 11_000);
        assert_eq!(policy.next_attempt_at(i64::MAX - 5, 1), i64::MAX);
    }

    #[test]
    fn test_rate_limiter_burst_then_throttle() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 3,
            refill_rate: 1,
        });

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.config().burst_size, 3);
    }

    #[test]
    fn test_rate_limiter_zero_config_does_not_panic() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 0,
            refill_rate: 0,
        });
        assert!(limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_rate_limiter_acquire_within_burst() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        for _ in 0..10 {
            limiter.acquire().await;
        }
    }
}
