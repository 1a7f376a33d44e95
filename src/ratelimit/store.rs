//! Limiter state backends.
//!
//! Each trait method performs the full read-modify-write for one attempt as
//! a single atomic operation; the distributed equivalent is one server-side
//! script per call, so call sites carry no retry loops. The in-memory
//! backend serializes per map, which subsumes the per-identifier critical
//! section the algorithms require.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;

/// Result of one atomic limiter script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub allowed: bool,
    pub remaining: u32,
    pub current: u32,
    pub retry_after_secs: u64,
}

/// Atomic storage for limiter state, keyed by identifier.
pub trait LimiterBackend: Send + Sync {
    /// Refill-then-spend on a token bucket.
    fn token_bucket(
        &self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
        cost: f64,
        now_ns: u64,
    ) -> Result<ScriptOutcome>;

    /// Trim-then-append on a sliding window.
    fn sliding_window(
        &self,
        key: &str,
        limit: u32,
        window_ns: u64,
        cost: u32,
        now_ns: u64,
    ) -> Result<ScriptOutcome>;
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill_ns: u64,
}

/// Process-local backend.
#[derive(Default)]
pub struct MemoryBackend {
    buckets: Mutex<HashMap<String, BucketState>>,
    windows: Mutex<HashMap<String, Vec<u64>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LimiterBackend for MemoryBackend {
    fn token_bucket(
        &self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
        cost: f64,
        now_ns: u64,
    ) -> Result<ScriptOutcome> {
        let mut buckets = self.buckets.lock().expect("bucket lock");
        let state = buckets.entry(key.to_string()).or_insert(BucketState {
            tokens: capacity,
            last_refill_ns: now_ns,
        });

        // last_refill is monotonic even if the caller's clock is not.
        let now_ns = now_ns.max(state.last_refill_ns);
        let elapsed_secs = (now_ns - state.last_refill_ns) as f64 / 1e9;
        state.tokens = (state.tokens + elapsed_secs * refill_per_sec).min(capacity);
        state.last_refill_ns = now_ns;

        if state.tokens >= cost {
            state.tokens -= cost;
            Ok(ScriptOutcome {
                allowed: true,
                remaining: state.tokens.floor() as u32,
                current: (capacity - state.tokens).ceil() as u32,
                retry_after_secs: 0,
            })
        } else {
            let deficit = cost - state.tokens;
            let retry_after_secs = if refill_per_sec > 0.0 {
                (deficit / refill_per_sec).ceil().max(1.0) as u64
            } else {
                u64::MAX
            };
            Ok(ScriptOutcome {
                allowed: false,
                remaining: state.tokens.floor() as u32,
                current: (capacity - state.tokens).ceil() as u32,
                retry_after_secs,
            })
        }
    }

    fn sliding_window(
        &self,
        key: &str,
        limit: u32,
        window_ns: u64,
        cost: u32,
        now_ns: u64,
    ) -> Result<ScriptOutcome> {
        let mut windows = self.windows.lock().expect("window lock");
        let entries = windows.entry(key.to_string()).or_default();

        // Drop entries at or before now - window. Until a full window has
        // elapsed that bound is negative, so nothing can have expired;
        // a clamped floor of zero must not evict entries stamped at zero.
        if now_ns >= window_ns {
            let floor = now_ns - window_ns;
            entries.retain(|ts| *ts > floor);
        }

        let current = entries.len() as u32;
        if current + cost <= limit {
            for _ in 0..cost {
                entries.push(now_ns);
            }
            Ok(ScriptOutcome {
                allowed: true,
                remaining: limit - current - cost,
                current: current + cost,
                retry_after_secs: 0,
            })
        } else {
            let retry_after_secs = match entries.first() {
                Some(oldest) => {
                    let reset_ns = oldest + window_ns;
                    let wait_ns = reset_ns.saturating_sub(now_ns);
                    (wait_ns as f64 / 1e9).ceil().max(1.0) as u64
                }
                // cost alone exceeds the limit; the window can never admit it.
                None => (window_ns as f64 / 1e9).ceil().max(1.0) as u64,
            };
            Ok(ScriptOutcome {
                allowed: false,
                remaining: limit.saturating_sub(current),
                current,
                retry_after_secs,
            })
        }
    }
}
