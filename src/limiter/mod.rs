//! Token-bucket rate limiting shared by all fetch workers.
//!
//! A denied acquisition is not an error: callers decide whether to wait
//! (`acquire_blocking`), fail, or fall back.

pub mod sqlite;

pub use sqlite::SharedStoreLimiter;

use crate::backoff::jitter;
use crate::storage::off_runtime;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Non-blocking permit source keyed by caller identity.
pub trait RateLimiter: Send + Sync {
    /// Take one token for `key` if available.
    fn try_acquire(&self, key: &str) -> bool;

    /// Whether `try_acquire` waits on file locks and must stay off async workers.
    fn blocking_io(&self) -> bool {
        false
    }
}

/// `try_acquire` that moves store-backed limiters onto the blocking pool.
///
/// A failed blocking task denies the request.
pub async fn try_acquire_async(limiter: &Arc<dyn RateLimiter>, key: &str) -> bool {
    if !limiter.blocking_io() {
        return limiter.try_acquire(key);
    }
    let limiter = Arc::clone(limiter);
    let key = key.to_string();
    off_runtime(move || limiter.try_acquire(&key)).await.unwrap_or(false)
}

/// Bucket shape: `refill` tokens are added per `window`, up to `capacity`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill: f64,
    pub window: Duration,
}

impl BucketConfig {
    pub fn new(capacity: f64, refill: f64, window: Duration) -> Self {
        Self {
            capacity: capacity.max(0.0),
            refill: refill.max(0.0),
            window,
        }
    }

    /// Tokens added per second.
    pub fn rate_per_sec(&self) -> f64 {
        let secs = self.window.as_secs_f64();
        if secs > 0.0 {
            self.refill / secs
        } else {
            self.capacity
        }
    }
}

/// Refill arithmetic shared by every limiter backend.
pub fn refill_tokens(tokens: f64, elapsed_secs: f64, rate: f64, capacity: f64) -> f64 {
    (tokens + elapsed_secs.max(0.0) * rate).clamp(0.0, capacity)
}

/// Token-bucket state for one key.
#[derive(Debug, Clone, Copy)]
pub struct RateBudget {
    pub capacity: f64,
    pub tokens: f64,
    pub last_refill: Instant,
}

impl RateBudget {
    pub fn full(capacity: f64, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant, rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = refill_tokens(self.tokens, elapsed, rate, self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    fn take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// In-process token bucket per key.
///
/// The refill-check-decrement sequence runs under one lock, so two workers
/// can never both spend the last token.
pub struct TokenBucketLimiter {
    config: BucketConfig,
    buckets: Mutex<HashMap<String, RateBudget>>,
}

impl TokenBucketLimiter {
    pub fn new(config: BucketConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire_at(&self, key: &str, now: Instant) -> bool {
        let rate = self.config.rate_per_sec();
        let mut buckets = self.buckets.lock();
        let budget = buckets
            .entry(key.to_string())
            .or_insert_with(|| RateBudget::full(self.config.capacity, now));
        budget.refill(now, rate);
        budget.take()
    }

    /// Remaining tokens for `key`, if the key has been seen.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.buckets.lock().get(key).map(|b| b.tokens)
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_at(key, Instant::now())
    }
}

/// Limiter that never denies. Used when limiting is disabled.
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn try_acquire(&self, _key: &str) -> bool {
        true
    }
}

const POLL_BASE: Duration = Duration::from_millis(50);
const POLL_MAX: Duration = Duration::from_secs(2);

/// Wait for a token, polling with jittered growing sleeps.
///
/// Returns `false` once `timeout` passes without a token.
pub async fn acquire_blocking(limiter: &Arc<dyn RateLimiter>, key: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut polls: u32 = 0;

    loop {
        if try_acquire_async(limiter, key).await {
            return true;
        }

        let now = Instant::now();
        if now >= deadline {
            debug!("Limiter wait for {} timed out after {:?}", key, timeout);
            return false;
        }

        let step = POLL_BASE.saturating_mul(2u32.saturating_pow(polls.min(6))).min(POLL_MAX);
        let pause = (step / 2 + jitter(step / 2)).min(deadline - now);
        tokio::time::sleep(pause).await;
        polls += 1;
    }
}

/// Stable identity for a credential that never reveals it: the first 16 hex
/// digits of its SHA-256.
pub fn token_identity(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.trim().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("token-{}", &digest[..16])
}

/// Build a limiter key from caller identity and network origin.
///
/// Both parts always appear so varying one of them cannot reuse another
/// caller's bucket.
pub fn composite_key(user: Option<&str>, origin: Option<&str>) -> String {
    let user = user.filter(|u| !u.is_empty()).unwrap_or("anon");
    let origin = origin.filter(|o| !o.is_empty()).unwrap_or("0.0.0.0");
    format!("user:{}|ip:{}", user, origin)
}
