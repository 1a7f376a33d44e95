//! Sliding window limiter.

use std::sync::Arc;

use crate::clock::Clock;
use crate::ratelimit::store::LimiterBackend;
use crate::ratelimit::{Decision, RateLimiter};

pub struct SlidingWindowLimiter {
    backend: Arc<dyn LimiterBackend>,
    clock: Arc<dyn Clock>,
    limit: u32,
    window_secs: u64,
    key_prefix: String,
}

impl SlidingWindowLimiter {
    pub fn new(
        backend: Arc<dyn LimiterBackend>,
        clock: Arc<dyn Clock>,
        limit: u32,
        window_secs: u64,
    ) -> Self {
        Self {
            backend,
            clock,
            limit,
            window_secs,
            key_prefix: "sw".to_string(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn attempt(&self, identifier: &str, cost: u32) -> Decision {
        let key = format!("{}:{identifier}", self.key_prefix);
        match self.backend.sliding_window(
            &key,
            self.limit,
            self.window_secs * 1_000_000_000,
            cost,
            self.clock.now_ns(),
        ) {
            Ok(out) if out.allowed => Decision::Allowed {
                remaining: out.remaining,
            },
            Ok(out) => Decision::Denied {
                limit: self.limit,
                current: out.current,
                retry_after_secs: out.retry_after_secs,
                layer: None,
            },
            Err(err) => {
                log::warn!("limiter backend failed for '{key}', failing open: {err}");
                Decision::Allowed {
                    remaining: self.limit,
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
    fn admits_then_denies_with_reset_hint() {
        let clock = ManualClock::new(0);
        let limiter = SlidingWindowLimiter::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(clock.clone()),
            3,
            10,
        );

        for t in 0..3u64 {
            clock.set_ns(t * 1_000_000_000);
            assert!(limiter.attempt("u1", 1).is_allowed(), "t={t}");
        }
        clock.set_ns(3 * 1_000_000_000);
        match limiter.attempt("u1", 1) {
            Decision::Denied {
                retry_after_secs, ..
            } => assert_eq!(retry_after_secs, 7),
            other => panic!("expected denial, got {other:?}"),
        }
        clock.set_ns(11 * 1_000_000_000);
        assert!(limiter.attempt("u1", 1).is_allowed());
    }

    #[test]
    fn cost_above_limit_always_denies() {
        let clock = ManualClock::new(0);
        let limiter = SlidingWindowLimiter::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(clock.clone()),
            3,
            10,
        );
        assert!(!limiter.attempt("u1", 4).is_allowed());
        clock.advance_secs(100);
        assert!(!limiter.attempt("u1", 4).is_allowed());
    }
}
