#![forbid(unsafe_code)]

//! Per-key token bucket limiter.
//!
//! Each key owns a bucket `(tokens, last_refill)` created lazily at full
//! capacity. Every observation refills continuously at `rate_per_second`
//! up to `capacity` and then stores the refilled level together with the
//! observation instant, whether or not the request was admitted.
//!
//! State lives only in process memory: a new limiter starts with every
//! bucket full. The number of buckets is capped (see
//! [`TokenBucketLimiter::with_max_tracked_keys`]).

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use tracing::{debug, trace};

/// Admission check keyed by caller identity.
pub trait RateGate: Send + Sync {
    fn try_acquire(&self, key: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitPolicy {
    pub rate_per_second: f64,
    pub capacity: f64,
}

impl Default for RateLimitPolicy {
    /// One call every ten seconds, bursts of three.
    fn default() -> Self {
        Self {
            rate_per_second: 0.1,
            capacity: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Upper bound on buckets held at once unless overridden.
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 10_000;

#[derive(Debug)]
pub struct TokenBucketLimiter {
    policy: RateLimitPolicy,
    max_tracked_keys: usize,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl Default for TokenBucketLimiter {
    fn default() -> Self {
        Self::new(RateLimitPolicy::default())
    }
}

impl TokenBucketLimiter {
    #[must_use]
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            max_tracked_keys: DEFAULT_MAX_TRACKED_KEYS,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Cap the number of buckets kept in memory.
    ///
    /// Admitting a new key at the cap first drops buckets that have refilled
    /// to capacity. Only when none are full is the bucket with the oldest
    /// refill instant evicted.
    #[must_use]
    pub fn with_max_tracked_keys(mut self, max: usize) -> Self {
        self.max_tracked_keys = max.max(1);
        self
    }

    /// Take `amount` tokens from the bucket for `key` at the current instant.
    pub fn consume(&self, key: &str, amount: f64) -> bool {
        self.consume_at(key, amount, Instant::now())
    }

    /// Take `amount` tokens from the bucket for `key` as observed at `now`.
    pub fn consume_at(&self, key: &str, amount: f64, now: Instant) -> bool {
        let mut buckets = self.lock_buckets();
        if !buckets.contains_key(key) && buckets.len() >= self.max_tracked_keys {
            self.make_room(&mut buckets, now);
        }
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.policy.capacity,
            last_refill: now,
        });

        let refilled = self.refilled(bucket, now);
        let allowed = refilled >= amount;
        bucket.tokens = if allowed { refilled - amount } else { refilled };
        // An out-of-order instant must not rewind the refill clock.
        bucket.last_refill = bucket.last_refill.max(now);

        trace!(key, allowed, tokens = bucket.tokens, "token bucket observed");
        allowed
    }

    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.lock_buckets().len()
    }

    fn refilled(&self, bucket: &Bucket, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        (bucket.tokens + elapsed.as_secs_f64() * self.policy.rate_per_second)
            .min(self.policy.capacity)
    }

    fn make_room(&self, buckets: &mut HashMap<String, Bucket>, now: Instant) {
        let before = buckets.len();
        buckets.retain(|_, bucket| self.refilled(bucket, now) < self.policy.capacity);
        if buckets.len() < self.max_tracked_keys {
            debug!(dropped = before - buckets.len(), "dropped refilled buckets");
            return;
        }

        let oldest = buckets
            .iter()
            .min_by_key(|(_, bucket)| bucket.last_refill)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            buckets.remove(&key);
            debug!(key = %key, "evicted oldest bucket");
        }
    }

    fn lock_buckets(&self) -> MutexGuard<'_, HashMap<String, Bucket>> {
        // A panic while holding the lock cannot leave a bucket half-written.
        match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[cfg(test)]
    fn available_at(&self, key: &str, now: Instant) -> f64 {
        match self.lock_buckets().get(key) {
            Some(bucket) => self.refilled(bucket, now),
            None => self.policy.capacity,
        }
    }
}

impl RateGate for TokenBucketLimiter {
    fn try_acquire(&self, key: &str) -> bool {
        self.consume(key, 1.0)
    }
}
