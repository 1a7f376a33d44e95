//! Load-adaptive limiter.
//!
//! Wraps a base limiter and scales request cost by a blended load factor:
//! `0.5*cpu + 0.3*mem + 0.2*circuit`, recomputed every
//! `load_update_interval_secs`. While the circuit is open the effective
//! limit is hard-reduced to a tenth of the base.

use std::sync::{Arc, Mutex};

use crate::circuit::{CircuitBreaker, CircuitState};
use crate::clock::Clock;
use crate::config::AdaptiveConfig;
use crate::ratelimit::{Decision, RateLimiter};

/// Host load readings. Split out so tests can fake pressure.
pub trait LoadProbe: Send + Sync {
    /// 1-minute load average.
    fn load_avg_1m(&self) -> f64;
    /// Resident set size of this process, in bytes.
    fn rss_bytes(&self) -> u64;
    /// Logical cores available.
    fn cores(&self) -> f64;
}

/// Reads /proc on Linux; reports an unloaded host elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcLoadProbe;

impl LoadProbe for ProcLoadProbe {
    #[cfg(target_os = "linux")]
    fn load_avg_1m(&self) -> f64 {
        std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|s| s.split_whitespace().next().map(str::to_string))
            .and_then(|f| f.parse().ok())
            .unwrap_or(0.0)
    }

    #[cfg(not(target_os = "linux"))]
    fn load_avg_1m(&self) -> f64 {
        0.0
    }

    #[cfg(target_os = "linux")]
    fn rss_bytes(&self) -> u64 {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| {
                s.split_whitespace()
                    .nth(1)
                    .and_then(|pages| pages.parse::<u64>().ok())
            })
            .map(|pages| pages * page_size)
            .unwrap_or(0)
    }

    #[cfg(not(target_os = "linux"))]
    fn rss_bytes(&self) -> u64 {
        0
    }

    fn cores(&self) -> f64 {
        std::thread::available_parallelism()
            .map(|n| n.get() as f64)
            .unwrap_or(1.0)
    }
}

struct CachedLoad {
    load_factor: f64,
    computed_at_ns: u64,
}

pub struct AdaptiveLimiter {
    base: Box<dyn RateLimiter>,
    config: AdaptiveConfig,
    breaker: Arc<CircuitBreaker>,
    probe: Box<dyn LoadProbe>,
    clock: Arc<dyn Clock>,
    /// Normalization ceiling for RSS.
    memory_limit_bytes: u64,
    cached: Mutex<CachedLoad>,
}

impl AdaptiveLimiter {
    pub fn new(
        base: Box<dyn RateLimiter>,
        config: AdaptiveConfig,
        breaker: Arc<CircuitBreaker>,
        probe: Box<dyn LoadProbe>,
        clock: Arc<dyn Clock>,
        memory_limit_bytes: u64,
    ) -> Self {
        Self {
            base,
            config,
            breaker,
            probe,
            clock,
            memory_limit_bytes: memory_limit_bytes.max(1),
            cached: Mutex::new(CachedLoad {
                load_factor: 0.0,
                computed_at_ns: 0,
            }),
        }
    }

    /// Current blended load factor in [0, 1], recomputed lazily.
    pub fn load_factor(&self) -> f64 {
        let now = self.clock.now_ns();
        let interval_ns = self.config.load_update_interval_secs * 1_000_000_000;
        let mut cached = self.cached.lock().expect("load cache lock");
        if now.saturating_sub(cached.computed_at_ns) >= interval_ns {
            cached.load_factor = self.compute_load_factor();
            cached.computed_at_ns = now;
        }
        cached.load_factor
    }

    fn compute_load_factor(&self) -> f64 {
        let cores = self.probe.cores().max(1.0);
        let cpu = (self.probe.load_avg_1m() / (0.8 * cores)).clamp(0.0, 1.0);
        let mem = (self.probe.rss_bytes() as f64 / (0.7 * self.memory_limit_bytes as f64))
            .clamp(0.0, 1.0);
        let circuit = match self.breaker.state() {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 0.5,
            CircuitState::Open => 1.0,
        };
        (0.5 * cpu + 0.3 * mem + 0.2 * circuit).clamp(0.0, 1.0)
    }

    /// Effective limit after load shedding.
    pub fn effective_limit(&self) -> u32 {
        let base = self.config.base_limit as f64;
        let floor = (0.1 * base).max(1.0);
        if self.breaker.state() == CircuitState::Open {
            return floor as u32;
        }
        let scaled = (base * (1.0 - self.config.adjustment_rate * self.load_factor())).ceil();
        scaled.max(floor) as u32
    }
}

impl RateLimiter for AdaptiveLimiter {
    fn attempt(&self, identifier: &str, cost: u32) -> Decision {
        let effective = self.effective_limit().max(1);
        // Shrinking the limit is expressed as inflating the cost.
        let scaled_cost =
            ((cost as f64 * self.config.base_limit as f64) / effective as f64).ceil() as u32;
        self.base.attempt(identifier, scaled_cost.max(1))
    }
}
