//! Exponential backoff with jitter.
//!
//! Shared by the request retry loop and the blocking limiter wait.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Retry schedule for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry (before jitter).
    pub base: Duration,
    /// Upper bound for the computed exponential delay.
    pub max_delay: Duration,
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Give up once waiting again would pass this much total time.
    pub max_elapsed: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
            max_elapsed: Duration::from_secs(120),
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (0-based).
    ///
    /// The exponential part is "equal jitter": half fixed, half random. A
    /// server hint raises the delay but never lowers it.
    pub fn delay_for(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        let exp = self.base.saturating_mul(factor).min(self.max_delay);
        let half = exp / 2;
        let delay = half + jitter(half);

        match hint {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }

    /// Whether another wait of `delay` still fits the elapsed budget.
    pub fn allows(&self, elapsed: Duration, delay: Duration) -> bool {
        elapsed.saturating_add(delay) <= self.max_elapsed
    }
}

/// A random duration in `[0, max]`.
///
/// Randomness comes from a freshly seeded `RandomState` hashing the clock's
/// nanoseconds. That is cheap and non-cryptographic, and only spreads
/// retries apart.
pub fn jitter(max: Duration) -> Duration {
    let span = max.as_nanos().min(u128::from(u64::MAX)) as u64;
    if span == 0 {
        return Duration::ZERO;
    }

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u32(nanos);

    Duration::from_nanos(hasher.finish() % span.saturating_add(1))
}
