//! Rate Limiter
//!
//! Per-identity token buckets with continuous refill. Buckets are created
//! lazily on first use and pruned once idle past the configured TTL so the
//! bucket map stays bounded. A permission rule may carry a per-rule override
//! of the default capacity/window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::GateError;
use crate::policy::RateSpec;

/// How often the idle sweep runs, at most
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    capacity: u32,
    refill_per_sec: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl Bucket {
    fn new(capacity: u32, window_secs: u64, now: Instant) -> Self {
        Self {
            tokens: capacity as f64,
            capacity,
            refill_per_sec: capacity as f64 / window_secs.max(1) as f64,
            last_refill: now,
            last_used: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec)
                .min(self.capacity as f64);
            self.last_refill = now;
        }
    }

    fn try_consume(&mut self, cost: u32, now: Instant) -> bool {
        self.refill(now);
        self.last_used = now;
        let cost = cost as f64;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    fn retry_after(&self, cost: u32) -> Duration {
        let deficit = (cost as f64 - self.tokens).max(0.0);
        Duration::from_secs_f64(deficit / self.refill_per_sec)
    }
}

#[derive(Debug)]
struct LimiterState {
    buckets: HashMap<String, Bucket>,
    last_prune: Instant,
}

/// Per-identity token bucket admission control
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState {
                buckets: HashMap::new(),
                last_prune: Instant::now(),
            }),
        }
    }

    /// Check whether an identity may proceed, consuming `cost` tokens.
    /// Returns the remaining whole tokens on success.
    pub fn check(&self, identity: &str, cost: u32) -> Result<u32, GateError> {
        self.check_with(identity, cost, None)
    }

    /// Like `check`, but a rule-supplied `RateSpec` overrides the default
    /// capacity and window for this identity's bucket.
    pub fn check_with(
        &self,
        identity: &str,
        cost: u32,
        spec: Option<&RateSpec>,
    ) -> Result<u32, GateError> {
        let now = Instant::now();
        let (capacity, window_secs) = match spec {
            Some(spec) => (spec.capacity, spec.window_secs),
            None => (self.config.capacity, self.config.window_secs),
        };

        let mut state = self.state.lock().expect("rate limiter lock");

        if now.duration_since(state.last_prune) >= PRUNE_INTERVAL {
            let ttl = Duration::from_secs(self.config.idle_ttl_secs);
            state.buckets.retain(|_, b| now.duration_since(b.last_used) < ttl);
            state.last_prune = now;
        }

        let bucket = state
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| Bucket::new(capacity, window_secs, now));

        // An override reshapes the bucket but never refunds spent tokens:
        // the balance carries over, clamped to the new capacity
        if bucket.capacity != capacity {
            bucket.refill(now);
            bucket.capacity = capacity;
            bucket.refill_per_sec = capacity as f64 / window_secs.max(1) as f64;
            bucket.tokens = bucket.tokens.min(capacity as f64);
        }

        if bucket.try_consume(cost, now) {
            Ok(bucket.tokens.floor() as u32)
        } else {
            let retry = bucket.retry_after(cost);
            debug!(identity, retry_secs = retry.as_secs(), "rate limit exceeded");
            Err(GateError::RateLimited {
                identity: identity.to_string(),
                retry_after_secs: retry.as_secs().max(1),
            })
        }
    }

    /// Drop buckets idle past the configured TTL; returns how many remain.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let ttl = Duration::from_secs(self.config.idle_ttl_secs);
        let mut state = self.state.lock().expect("rate limiter lock");
        state.buckets.retain(|_, b| now.duration_since(b.last_used) < ttl);
        state.last_prune = now;
        state.buckets.len()
    }

    /// Number of live buckets
    pub fn bucket_count(&self) -> usize {
        self.state.lock().expect("rate limiter lock").buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            capacity,
            window_secs,
            idle_ttl_secs: 3600,
        })
    }

    #[test]
    fn test_allows_until_capacity_exhausted() {
        let limiter = limiter(3, 60);
        assert_eq!(limiter.check("alice", 1).unwrap(), 2);
        assert_eq!(limiter.check("alice", 1).unwrap(), 1);
        assert_eq!(limiter.check("alice", 1).unwrap(), 0);

        let err = limiter.check("alice", 1).unwrap_err();
        match err {
            GateError::RateLimited {
                identity,
                retry_after_secs,
            } => {
                assert_eq!(identity, "alice");
                assert!(retry_after_secs >= 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_identities_have_independent_buckets() {
        let limiter = limiter(1, 60);
        assert!(limiter.check("alice", 1).is_ok());
        assert!(limiter.check("alice", 1).is_err());
        assert!(limiter.check("bob", 1).is_ok());
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn test_continuous_refill() {
        // 10 tokens per second
        let limiter = limiter(10, 1);
        for _ in 0..10 {
            assert!(limiter.check("alice", 1).is_ok());
        }
        assert!(limiter.check("alice", 1).is_err());

        std::thread::sleep(Duration::from_millis(250));
        // Roughly 2.5 tokens refilled
        assert!(limiter.check("alice", 1).is_ok());
        assert!(limiter.check("alice", 1).is_ok());
    }

    #[test]
    fn test_override_never_refunds_spent_tokens() {
        let limiter = limiter(2, 3600);
        assert!(limiter.check("alice", 1).is_ok());
        assert!(limiter.check("alice", 1).is_ok());
        assert!(limiter.check("alice", 1).is_err());

        // Routing through a rule with a larger override must not hand an
        // exhausted identity a fresh allowance
        let generous = RateSpec {
            capacity: 5,
            window_secs: 3600,
        };
        assert!(limiter.check_with("alice", 1, Some(&generous)).is_err());

        // Nor may flipping back to the default re-mint the bucket
        assert!(limiter.check("alice", 1).is_err());
    }

    #[test]
    fn test_override_clamps_balance_to_smaller_capacity() {
        let limiter = limiter(10, 3600);
        assert!(limiter.check("alice", 1).is_ok());

        // 9 tokens remain; a capacity-2 override clamps the balance to 2
        let strict = RateSpec {
            capacity: 2,
            window_secs: 3600,
        };
        assert!(limiter.check_with("alice", 2, Some(&strict)).is_ok());
        assert!(limiter.check_with("alice", 1, Some(&strict)).is_err());
    }

    #[test]
    fn test_rule_override_shapes_bucket() {
        let limiter = limiter(10, 60);
        let spec = RateSpec {
            capacity: 1,
            window_secs: 60,
        };
        assert!(limiter.check_with("alice", 1, Some(&spec)).is_ok());
        assert!(limiter.check_with("alice", 1, Some(&spec)).is_err());
    }

    #[test]
    fn test_prune_idle_buckets() {
        let limiter = RateLimiter::new(RateLimitConfig {
            capacity: 5,
            window_secs: 60,
            idle_ttl_secs: 0,
        });
        assert!(limiter.check("alice", 1).is_ok());
        assert_eq!(limiter.bucket_count(), 1);

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(limiter.prune_idle(), 0);
    }

    #[test]
    fn test_cost_greater_than_one() {
        let limiter = limiter(10, 60);
        assert_eq!(limiter.check("alice", 5).unwrap(), 5);
        assert!(limiter.check("alice", 6).is_err());
        assert!(limiter.check("alice", 5).is_ok());
    }
}
