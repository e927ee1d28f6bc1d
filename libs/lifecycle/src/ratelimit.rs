//! Requeue rate limiting for hosts.
//!
//! [`StaticThenExponentialRateLimiter`] hands out a flat delay while a work
//! item is within its static window (measured from its first failed attempt)
//! and falls back to per-item exponential backoff afterwards. `forget`
//! resets both phases, typically after a successful reconcile.
//!
//! Keys are shared across concurrent reconciles, so all tracking maps sit
//! behind a mutex.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::ConfigError;

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Delay returned inside the static window.
    pub static_delay: Duration,

    /// How long after the first attempt the static delay applies.
    pub static_window: Duration,

    /// First exponential delay once the window has passed.
    pub initial_backoff: Duration,

    /// Cap for the exponential delay.
    pub max_backoff: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            static_delay: DEFAULT_STATIC_DELAY,
            static_window: DEFAULT_STATIC_WINDOW,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RateLimiterConfig {
    /// Check the ordering constraints between the delays.
    ///
    /// Durations cannot be negative, so the `>= 0` constraints hold by type.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff < self.static_delay {
            return Err(ConfigError::RateLimiter(format!(
                "initial backoff ({:?}) must be >= static delay ({:?})",
                self.initial_backoff, self.static_delay
            )));
        }
        if self.static_window < self.static_delay {
            return Err(ConfigError::RateLimiter(format!(
                "static window ({:?}) must be >= static delay ({:?})",
                self.static_window, self.static_delay
            )));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::RateLimiter(format!(
                "max backoff ({:?}) must be >= initial backoff ({:?})",
                self.max_backoff, self.initial_backoff
            )));
        }
        Ok(())
    }
}

/// Per-item exponential backoff: `initial * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialRateLimiter<K> {
    initial: Duration,
    max: Duration,
    failures: Mutex<BTreeMap<K, u32>>,
}

impl<K: Ord + Clone> ItemExponentialRateLimiter<K> {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            failures: Mutex::new(BTreeMap::new()),
        }
    }

    /// Delay for the next retry of `key`, recording the attempt.
    pub fn when(&self, key: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(key.clone()).or_insert(0);
        let exponent = *count;
        *count = count.saturating_add(1);

        2u32.checked_pow(exponent)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }

    pub fn forget(&self, key: &K) {
        lock(&self.failures).remove(key);
    }
}

/// Flat delay inside a window, exponential backoff after it.
#[derive(Debug)]
pub struct StaticThenExponentialRateLimiter<K> {
    config: RateLimiterConfig,

    /// key -> (first attempt, attempts so far).
    attempts: Mutex<BTreeMap<K, (Instant, u32)>>,

    exponential: ItemExponentialRateLimiter<K>,
}

impl<K: Ord + Clone> StaticThenExponentialRateLimiter<K> {
    /// Build a limiter from a validated configuration.
    pub fn new(config: RateLimiterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let exponential =
            ItemExponentialRateLimiter::new(config.initial_backoff, config.max_backoff);
        Ok(Self {
            config,
            attempts: Mutex::new(BTreeMap::new()),
            exponential,
        })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Delay before `key` is retried.
    pub fn when(&self, key: &K) -> Duration {
        let now = Instant::now();
        let within_window = {
            let mut attempts = lock(&self.attempts);
            let (first, count) = attempts.entry(key.clone()).or_insert((now, 0));
            *count = count.saturating_add(1);
            now.duration_since(*first) <= self.config.static_window
        };

        if within_window {
            self.config.static_delay
        } else {
            self.exponential.when(key)
        }
    }

    /// How many times `key` has been rate limited since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        lock(&self.attempts).get(key).map_or(0, |(_, count)| *count)
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        lock(&self.attempts).len()
    }

    /// Clear all tracking for `key`.
    pub fn forget(&self, key: &K) {
        lock(&self.attempts).remove(key);
        self.exponential.forget(key);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Default flat delay.
pub const DEFAULT_STATIC_DELAY: Duration = Duration::from_secs(5);

/// Default static window.
pub const DEFAULT_STATIC_WINDOW: Duration = Duration::from_secs(60);

/// Default first exponential delay.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(5);

/// Default exponential cap.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(120);
