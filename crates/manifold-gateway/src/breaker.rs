//! Per-adapter circuit breaker.
//!
//! The state machine is explicit: closed, open, half-open. It wraps the
//! dispatch of a whole request, not the backend SDK call, so auth and
//! validation stay outside it. Time is injected so the transitions are
//! testable.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Sampling window for the failure ratio.
    pub window: Duration,
    /// Minimum requests inside the window before the breaker may trip.
    pub min_requests: u32,
    /// Consecutive-failure trip threshold.
    pub consecutive_failures: u32,
    /// Failure-ratio trip threshold over the window.
    pub failure_ratio: f64,
    /// How long to stay open before admitting probes.
    pub open_timeout: Duration,
    /// Probes admitted while half-open.
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            min_requests: 3,
            consecutive_failures: 5,
            failure_ratio: 0.6,
            open_timeout: Duration::from_secs(10),
            half_open_probes: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

struct Inner {
    state: BreakerState,
    window_start: Instant,
    requests: u32,
    failures: u32,
    consecutive: u32,
    opened_at: Instant,
    probes_in_flight: u32,
    probe_successes: u32,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    // Snapshot for lock-free reads on the stats path.
    state_tag: AtomicU8,
}

const TAG_CLOSED: u8 = 0;
const TAG_OPEN: u8 = 1;
const TAG_HALF_OPEN: u8 = 2;

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window_start: Instant::now(),
                requests: 0,
                failures: 0,
                consecutive: 0,
                opened_at: Instant::now(),
                probes_in_flight: 0,
                probe_successes: 0,
            }),
            state_tag: AtomicU8::new(TAG_CLOSED),
        }
    }

    fn publish_state(&self, state: BreakerState) {
        let tag = match state {
            BreakerState::Closed => TAG_CLOSED,
            BreakerState::Open => TAG_OPEN,
            BreakerState::HalfOpen => TAG_HALF_OPEN,
        };
        self.state_tag.store(tag, Ordering::Relaxed);
    }

    /// Lock-free snapshot, suitable for stats and metrics.
    pub fn state(&self) -> BreakerState {
        match self.state_tag.load(Ordering::Relaxed) {
            TAG_OPEN => BreakerState::Open,
            TAG_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// Whether a request may proceed right now.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                if now.duration_since(inner.window_start) > self.config.window {
                    inner.window_start = now;
                    inner.requests = 0;
                    inner.failures = 0;
                }
                inner.requests += 1;
                true
            }
            BreakerState::Open => {
                if now.duration_since(inner.opened_at) < self.config.open_timeout {
                    return false;
                }
                inner.state = BreakerState::HalfOpen;
                inner.probes_in_flight = 1;
                inner.probe_successes = 0;
                self.publish_state(BreakerState::HalfOpen);
                true
            }
            BreakerState::HalfOpen => {
                if inner.probes_in_flight + inner.probe_successes < self.config.half_open_probes {
                    inner.probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn on_success_at(&self, _now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => inner.consecutive = 0,
            BreakerState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.half_open_probes {
                    inner.state = BreakerState::Closed;
                    inner.requests = 0;
                    inner.failures = 0;
                    inner.consecutive = 0;
                    self.publish_state(BreakerState::Closed);
                }
            }
            BreakerState::Open => (),
        }
    }

    pub fn on_success(&self) {
        self.on_success_at(Instant::now());
    }

    pub fn on_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                inner.consecutive += 1;
                let ratio = if inner.requests == 0 {
                    0.0
                } else {
                    f64::from(inner.failures) / f64::from(inner.requests)
                };
                if inner.requests >= self.config.min_requests
                    && (inner.consecutive >= self.config.consecutive_failures
                        || ratio >= self.config.failure_ratio)
                {
                    inner.state = BreakerState::Open;
                    inner.opened_at = now;
                    self.publish_state(BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = now;
                inner.probes_in_flight = 0;
                inner.probe_successes = 0;
                self.publish_state(BreakerState::Open);
            }
            BreakerState::Open => (),
        }
    }

    pub fn on_failure(&self) {
        self.on_failure_at(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(consecutive: u32) -> BreakerConfig {
        BreakerConfig {
            consecutive_failures: consecutive,
            ..BreakerConfig::default()
        }
    }

    #[test]
    fn trips_after_consecutive_failures_and_fails_fast() {
        let breaker = CircuitBreaker::new(config(3));
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(breaker.try_acquire_at(t0));
            breaker.on_failure_at(t0);
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        // The next call fails fast without reaching the backend.
        assert!(!breaker.try_acquire_at(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn trips_on_failure_ratio() {
        let breaker = CircuitBreaker::new(config(100));
        let t0 = Instant::now();

        // 5 requests, 3 failures: ratio 0.6 with enough volume.
        for _ in 0..5 {
            assert!(breaker.try_acquire_at(t0));
        }
        breaker.on_success_at(t0);
        breaker.on_success_at(t0);
        breaker.on_failure_at(t0);
        breaker.on_failure_at(t0);
        breaker.on_failure_at(t0);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn below_minimum_volume_never_trips() {
        let breaker = CircuitBreaker::new(config(1));
        let t0 = Instant::now();

        assert!(breaker.try_acquire_at(t0));
        breaker.on_failure_at(t0);
        // One failure in the window is below min_requests.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_probe_is_admitted_after_timeout() {
        let breaker = CircuitBreaker::new(config(3));
        let t0 = Instant::now();
        for _ in 0..3 {
            assert!(breaker.try_acquire_at(t0));
            breaker.on_failure_at(t0);
        }
        assert!(!breaker.try_acquire_at(t0 + Duration::from_secs(9)));

        // After the open timeout, one probe is admitted.
        let t1 = t0 + Duration::from_secs(10);
        assert!(breaker.try_acquire_at(t1));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn successful_probes_close_the_breaker() {
        let breaker = CircuitBreaker::new(config(3));
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.try_acquire_at(t0);
            breaker.on_failure_at(t0);
        }
        let t1 = t0 + Duration::from_secs(11);
        for _ in 0..3 {
            assert!(breaker.try_acquire_at(t1));
            breaker.on_success_at(t1);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire_at(t1 + Duration::from_secs(1)));
    }

    #[test]
    fn failed_probe_reopens_the_breaker() {
        let breaker = CircuitBreaker::new(config(3));
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.try_acquire_at(t0);
            breaker.on_failure_at(t0);
        }
        let t1 = t0 + Duration::from_secs(11);
        assert!(breaker.try_acquire_at(t1));
        breaker.on_failure_at(t1);
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.try_acquire_at(t1 + Duration::from_secs(1)));
    }

    #[test]
    fn only_three_probes_are_admitted_while_half_open() {
        let breaker = CircuitBreaker::new(config(3));
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.try_acquire_at(t0);
            breaker.on_failure_at(t0);
        }
        let t1 = t0 + Duration::from_secs(11);
        assert!(breaker.try_acquire_at(t1));
        assert!(breaker.try_acquire_at(t1));
        assert!(breaker.try_acquire_at(t1));
        assert!(!breaker.try_acquire_at(t1));
    }
}
