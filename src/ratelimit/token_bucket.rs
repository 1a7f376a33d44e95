//! Token bucket limiter.

use std::sync::Arc;

use crate::clock::Clock;
use crate::ratelimit::store::LimiterBackend;
use crate::ratelimit::{Decision, RateLimiter};

pub struct TokenBucketLimiter {
    backend: Arc<dyn LimiterBackend>,
    clock: Arc<dyn Clock>,
    capacity: u32,
    refill_per_sec: f64,
    key_prefix: String,
}

impl TokenBucketLimiter {
    pub fn new(
        backend: Arc<dyn LimiterBackend>,
        clock: Arc<dyn Clock>,
        capacity: u32,
        refill_per_sec: f64,
    ) -> Self {
        Self {
            backend,
            clock,
            capacity,
            refill_per_sec,
            key_prefix: "tb".to_string(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn attempt(&self, identifier: &str, cost: u32) -> Decision {
        let key = format!("{}:{identifier}", self.key_prefix);
        match self.backend.token_bucket(
            &key,
            self.capacity as f64,
            self.refill_per_sec,
            cost as f64,
            self.clock.now_ns(),
        ) {
            Ok(out) if out.allowed => Decision::Allowed {
                remaining: out.remaining,
            },
            Ok(out) => Decision::Denied {
                limit: self.capacity,
                current: out.current,
                retry_after_secs: out.retry_after_secs,
                layer: None,
            },
            Err(err) => {
                // Availability bias: a broken store admits rather than blocks.
                log::warn!("limiter backend failed for '{key}', failing open: {err}");
                Decision::Allowed {
                    remaining: self.capacity,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::MemoryBackend;

    #[test]
    fn spend_deny_then_refill() {
        let clock = ManualClock::new(1_000_000_000);
        let limiter = TokenBucketLimiter::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(clock.clone()),
            5,
            1.0,
        );

        assert_eq!(limiter.attempt("u1", 3), Decision::Allowed { remaining: 2 });
        match limiter.attempt("u1", 3) {
            Decision::Denied {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, 1),
            other => panic!("expected denial, got {other:?}"),
        }
        clock.advance_secs(3);
        assert_eq!(limiter.attempt("u1", 3), Decision::Allowed { remaining: 2 });
    }
}
