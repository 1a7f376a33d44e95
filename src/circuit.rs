//! Circuit breaker guarding broker calls.
//!
//! closed -> open when the failure threshold is crossed within the rolling
//! interval; open -> half-open after the cooldown; half-open -> closed on a
//! successful probe, back to open on a failed one.

use std::sync::Arc;
use std::sync::Mutex;

use crate::clock::Clock;
use crate::config::CircuitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// Failure timestamps within the rolling interval.
    failures: Vec<u64>,
    last_transition_ns: u64,
    probes_in_flight: u32,
}

pub struct CircuitBreaker {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ns();
        Self {
            config,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: Vec::new(),
                last_transition_ns: now,
                probes_in_flight: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("circuit lock");
        self.roll(&mut inner);
        inner.state
    }

    /// Whether a call may proceed. While half-open, admits at most
    /// `half_open_max_probes` concurrent probes per cooldown.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit lock");
        self.roll(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_max_probes {
                    inner.probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit lock");
        self.roll(&mut inner);
        match inner.state {
            CircuitState::HalfOpen => {
                log::info!("circuit closed after successful probe");
                self.transition(&mut inner, CircuitState::Closed);
            }
            CircuitState::Closed => {
                inner.failures.clear();
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit lock");
        self.roll(&mut inner);
        let now = self.clock.now_ns();
        match inner.state {
            CircuitState::HalfOpen => {
                log::warn!("probe failed, circuit re-opened");
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed => {
                inner.failures.push(now);
                self.trim_window(&mut inner, now);
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    log::warn!(
                        "circuit opened after {} failures",
                        inner.failures.len()
                    );
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Move open -> half-open once the cooldown has elapsed.
    fn roll(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            let now = self.clock.now_ns();
            let cooldown_ns = self.config.cooldown_ms * 1_000_000;
            if now.saturating_sub(inner.last_transition_ns) >= cooldown_ns {
                self.transition(inner, CircuitState::HalfOpen);
            }
        }
    }

    fn transition(&self, inner: &mut Inner, next: CircuitState) {
        inner.state = next;
        inner.last_transition_ns = self.clock.now_ns();
        inner.failures.clear();
        inner.probes_in_flight = 0;
    }

    /// Drop failures older than the cooldown interval.
    fn trim_window(&self, inner: &mut Inner, now: u64) {
        let window_ns = self.config.cooldown_ms * 1_000_000;
        inner.failures.retain(|ts| now.saturating_sub(*ts) < window_ns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(clock: &ManualClock) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitConfig {
                failure_threshold: 3,
                cooldown_ms: 1000,
                half_open_max_probes: 1,
            },
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn opens_on_threshold_and_recovers() {
        let clock = ManualClock::new(1_000_000_000);
        let cb = breaker(&clock);

        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());

        clock.advance_ns(1_100_000_000);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_single_probe_per_cooldown() {
        let clock = ManualClock::new(1_000_000_000);
        let cb = breaker(&clock);
        for _ in 0..3 {
            cb.record_failure();
        }
        clock.advance_ns(1_100_000_000);
        assert!(cb.allow());
        assert!(!cb.allow());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        clock.advance_ns(1_100_000_000);
        assert!(cb.allow());
        assert!(!cb.allow());
    }

    #[test]
    fn stale_failures_fall_out_of_the_window() {
        let clock = ManualClock::new(1_000_000_000);
        let cb = breaker(&clock);
        cb.record_failure();
        cb.record_failure();
        clock.advance_ns(2_000_000_000);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
