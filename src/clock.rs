//! Timestamp sources.
//!
//! Every time-sensitive component (rate limiters, circuit breaker, presence
//! timestamps) takes a clock so tests can advance time without sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of timestamps, in nanoseconds since the UNIX epoch.
pub trait Clock: Send + Sync + 'static {
    fn now_ns(&self) -> u64;

    /// Current time in whole seconds.
    fn now_secs(&self) -> u64 {
        self.now_ns() / 1_000_000_000
    }
}

/// Wall-clock time via `std::time::SystemTime`.
///
/// Susceptible to NTP adjustments but requires no calibration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ns(&self) -> u64 {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch");
        u64::try_from(timestamp.as_nanos()).expect("system time exceeds timestamp range")
    }
}

/// TSC-based time via the `quanta` crate.
///
/// Anchors to SystemTime at initialization and progresses by TSC ticks,
/// so timestamps never jump backward.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    start_wall_ns: u64,
    start_instant: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start_instant = clock.now();
        let start_wall_ns = SystemClock.now_ns();
        Self {
            clock,
            start_wall_ns,
            start_instant,
        }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for QuantaClock {
    fn now_ns(&self) -> u64 {
        let elapsed = self.clock.now().duration_since(self.start_instant);
        self.start_wall_ns + elapsed.as_nanos() as u64
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ns: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now_ns: Arc::new(AtomicU64::new(start_ns)),
        }
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance_ns(secs * 1_000_000_000);
    }

    pub fn advance_ns(&self, ns: u64) {
        self.now_ns.fetch_add(ns, Ordering::SeqCst);
    }

    pub fn set_ns(&self, ns: u64) {
        self.now_ns.store(ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }
}
