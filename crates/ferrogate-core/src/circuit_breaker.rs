use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

/// How long callers rejected by a busy half-open probe should back off.
pub const PROBE_BUSY_BACKOFF: Duration = Duration::from_millis(250);

/// Runtime circuit state for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// Failures older than this no longer count towards the threshold.
    pub failure_window: Duration,
    pub reset_timeout: Duration,
    /// Successful half-open probes needed before closing again.
    pub successes_to_close: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(60),
            successes_to_close: 1,
        }
    }
}

/// A call was refused without reaching the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerRejected {
    pub state: CircuitState,
    /// Earliest point at which another attempt may be let through.
    pub retry_in: Duration,
}

/// Read-only breaker diagnostics for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_successes: u32,
    pub probe_in_flight: bool,
    pub calls_total: u64,
    pub failures_total: u64,
    pub rejected_total: u64,
    pub trips_total: u64,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    half_open_successes: u32,
    probe_in_flight: bool,
    opened_at: Option<Instant>,
    calls_total: u64,
    failures_total: u64,
    rejected_total: u64,
    trips_total: u64,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            half_open_successes: 0,
            probe_in_flight: false,
            opened_at: None,
            calls_total: 0,
            failures_total: 0,
            rejected_total: 0,
            trips_total: 0,
        }
    }
}

/// Thread-safe circuit breaker guarding one endpoint.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            name: String::from("default"),
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    /// Name used in log events, usually the endpoint id.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Asks to place one call. In half-open state only a single probe may be
    /// in flight; everyone else is rejected as if the circuit were open.
    pub fn try_acquire(&self, now: Instant) -> Result<BreakerPermit<'_>, BreakerRejected> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => Ok(BreakerPermit::new(self, false)),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.probe_in_flight = true;
                    info!(breaker = %self.name, "circuit breaker half-open; probing");
                    Ok(BreakerPermit::new(self, true))
                } else {
                    inner.rejected_total = inner.rejected_total.saturating_add(1);
                    Err(BreakerRejected {
                        state: CircuitState::Open,
                        retry_in: self.config.reset_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.rejected_total = inner.rejected_total.saturating_add(1);
                    Err(BreakerRejected {
                        state: CircuitState::Open,
                        retry_in: PROBE_BUSY_BACKOFF,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(BreakerPermit::new(self, true))
                }
            }
        }
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        inner.calls_total = inner.calls_total.saturating_add(1);

        let state = inner.state;
        match state {
            CircuitState::HalfOpen if probe => {
                inner.probe_in_flight = false;
                inner.half_open_successes = inner.half_open_successes.saturating_add(1);
                if inner.half_open_successes >= self.config.successes_to_close {
                    inner.state = CircuitState::Closed;
                    inner.failures.clear();
                    inner.opened_at = None;
                    info!(breaker = %self.name, "circuit breaker closed");
                }
            }
            CircuitState::Closed => inner.failures.clear(),
            // Stale result from a call admitted before the circuit tripped.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, probe: bool, now: Instant) {
        let mut inner = self.inner.lock();
        inner.calls_total = inner.calls_total.saturating_add(1);
        inner.failures_total = inner.failures_total.saturating_add(1);

        let state = inner.state;
        match state {
            CircuitState::HalfOpen if probe => {
                inner.probe_in_flight = false;
                self.trip(&mut inner, now);
            }
            CircuitState::Closed => {
                inner.failures.push_back(now);
                while inner.failures.front().is_some_and(|failed_at| {
                    now.saturating_duration_since(*failed_at) >= self.config.failure_window
                }) {
                    inner.failures.pop_front();
                }
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    self.trip(&mut inner, now);
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_abandon(&self, probe: bool) {
        if probe {
            self.inner.lock().probe_in_flight = false;
        }
    }

    fn trip(&self, inner: &mut CircuitInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.half_open_successes = 0;
        inner.trips_total = inner.trips_total.saturating_add(1);
        warn!(
            breaker = %self.name,
            failures = inner.failures.len(),
            reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
            "circuit breaker opened"
        );
    }

    /// Forces the breaker back to closed and forgets recent failures.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.half_open_successes = 0;
        inner.probe_in_flight = false;
        inner.opened_at = None;
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Time left before an open circuit lets a probe through, or `None` when
    /// the circuit is not open (or the reset timeout has already elapsed).
    pub fn open_remaining(&self, now: Instant) -> Option<Duration> {
        let inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return None;
        }
        let elapsed = now.saturating_duration_since(inner.opened_at.unwrap_or(now));
        self.config
            .reset_timeout
            .checked_sub(elapsed)
            .filter(|remaining| !remaining.is_zero())
    }

    /// Failures recorded within `failure_window` of `now`.
    pub fn failure_count(&self, now: Instant) -> u32 {
        self.failures_in_window(&self.inner.lock(), now)
    }

    fn failures_in_window(&self, inner: &CircuitInner, now: Instant) -> u32 {
        inner
            .failures
            .iter()
            .filter(|failed_at| {
                now.saturating_duration_since(**failed_at) < self.config.failure_window
            })
            .count() as u32
    }

    pub fn snapshot(&self, now: Instant) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: self.failures_in_window(&inner, now),
            half_open_successes: inner.half_open_successes,
            probe_in_flight: inner.probe_in_flight,
            calls_total: inner.calls_total,
            failures_total: inner.failures_total,
            rejected_total: inner.rejected_total,
            trips_total: inner.trips_total,
        }
    }
}

/// Admission to place one call. Must be settled with [`succeed`](Self::succeed)
/// or [`fail`](Self::fail); dropping it unsettled (cancellation) frees a
/// half-open probe slot without counting a failure.
#[derive(Debug)]
#[must_use = "an unsettled permit records neither success nor failure"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    pub const fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn fail(mut self, now: Instant) {
        self.settled = true;
        self.breaker.on_failure(self.probe, now);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandon(self.probe);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            failure_window: Duration::from_secs(60),
            reset_timeout: Duration::from_millis(reset_ms),
            successes_to_close: 1,
        })
    }

    fn fail_once(breaker: &CircuitBreaker, now: Instant) {
        breaker.try_acquire(now).expect("call allowed").fail(now);
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = breaker(2, 10);
        let now = Instant::now();

        assert_eq!(breaker.state(), CircuitState::Closed);
        fail_once(&breaker, now);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail_once(&breaker, now);
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected = breaker.try_acquire(now).expect_err("open circuit rejects");
        assert_eq!(rejected.retry_in, Duration::from_millis(10));
    }

    #[test]
    fn failures_outside_window_do_not_trip() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            failure_window: Duration::from_secs(10),
            ..CircuitBreakerConfig::default()
        });
        let start = Instant::now();

        fail_once(&breaker, start);
        fail_once(&breaker, start + Duration::from_secs(11));

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(start + Duration::from_secs(11)), 1);
    }

    #[test]
    fn failure_count_ignores_failures_that_aged_out() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            ..CircuitBreakerConfig::default()
        });
        let start = Instant::now();
        fail_once(&breaker, start);
        fail_once(&breaker, start + Duration::from_secs(30));

        assert_eq!(breaker.failure_count(start + Duration::from_secs(59)), 2);
        assert_eq!(breaker.failure_count(start + Duration::from_secs(60)), 1);

        let much_later = start + Duration::from_secs(600);
        assert_eq!(breaker.failure_count(much_later), 0);
        assert_eq!(breaker.snapshot(much_later).failure_count, 0);
        assert_eq!(breaker.snapshot(much_later).failures_total, 2);
    }

    #[test]
    fn open_remaining_counts_down_to_half_open() {
        let breaker = breaker(1, 100);
        let start = Instant::now();
        assert_eq!(breaker.open_remaining(start), None);

        fail_once(&breaker, start);

        assert_eq!(
            breaker.open_remaining(start + Duration::from_millis(40)),
            Some(Duration::from_millis(60))
        );
        assert_eq!(breaker.open_remaining(start + Duration::from_millis(100)), None);
    }

    #[test]
    fn transitions_to_half_open_after_timeout_then_closes_on_success() {
        let breaker = breaker(1, 1);
        let start = Instant::now();

        fail_once(&breaker, start);
        assert_eq!(breaker.state(), CircuitState::Open);

        let probe = breaker
            .try_acquire(start + Duration::from_millis(2))
            .expect("probe allowed after reset timeout");
        assert!(probe.is_probe());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        probe.succeed();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(start + Duration::from_millis(2)), 0);
    }

    #[test]
    fn half_open_allows_exactly_one_probe() {
        let breaker = breaker(1, 5);
        let start = Instant::now();
        fail_once(&breaker, start);

        let later = start + Duration::from_millis(5);
        let probe = breaker.try_acquire(later).expect("first probe");
        let rejected = breaker.try_acquire(later).expect_err("second caller rejected");

        assert_eq!(rejected.state, CircuitState::Open);
        drop(probe);
        assert!(breaker.try_acquire(later).is_ok(), "abandoned probe frees the slot");
    }

    #[test]
    fn probe_failure_reopens_and_restarts_timer() {
        let breaker = breaker(1, 5);
        let start = Instant::now();
        fail_once(&breaker, start);

        let probe_at = start + Duration::from_millis(5);
        breaker.try_acquire(probe_at).expect("probe").fail(probe_at);

        assert_eq!(breaker.state(), CircuitState::Open);
        let rejected = breaker
            .try_acquire(probe_at + Duration::from_millis(1))
            .expect_err("timer restarted");
        assert_eq!(rejected.retry_in, Duration::from_millis(4));
        assert_eq!(breaker.snapshot(probe_at).trips_total, 2);
    }

    #[test]
    fn closing_can_require_several_probe_successes() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::ZERO,
            successes_to_close: 2,
            ..CircuitBreakerConfig::default()
        });
        let now = Instant::now();
        fail_once(&breaker, now);

        breaker.try_acquire(now).expect("probe 1").succeed();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.try_acquire(now).expect("probe 2").succeed();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn abandoned_permit_does_not_count_as_failure() {
        let breaker = breaker(1, 10);
        let permit = breaker.try_acquire(Instant::now()).expect("closed");

        drop(permit);

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot(Instant::now()).failures_total, 0);
    }
}
