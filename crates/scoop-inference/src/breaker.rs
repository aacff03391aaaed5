use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

/// Raised by `check_state` when the circuit is open and requests should
/// fail fast to the fallback model.
#[derive(Debug, thiserror::Error)]
#[error("circuit breaker '{name}' is OPEN, recovery in {recovery_in:?}")]
pub struct CircuitOpenError {
    pub name: String,
    pub recovery_in: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug)]
struct FailureRecord {
    at: Instant,
    kind: String,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: Vec<FailureRecord>,
    opened_at: Option<Instant>,
    total_failures: u64,
    total_successes: u64,
}

/// Snapshot of breaker counters for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: usize,
    pub failure_threshold: usize,
    pub total_failures: u64,
    pub total_successes: u64,
}

/// Circuit breaker protecting the primary model.
///
/// CLOSED → OPEN when `failure_threshold` failures land inside the sliding
/// `failure_window`. OPEN → HALF_OPEN lazily once `recovery_timeout` has
/// elapsed — observed at state reads, no timer. HALF_OPEN closes on the
/// first success and reopens on the first failure.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: usize,
    recovery_timeout: Duration,
    failure_window: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: usize,
        recovery_timeout: Duration,
        failure_window: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery_timeout,
            failure_window,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: Vec::new(),
                opened_at: None,
                total_failures: 0,
                total_successes: 0,
            }),
        }
    }

    /// Current state, applying the lazy OPEN → HALF_OPEN transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Fail fast before making an API call.
    pub fn check_state(&self) -> Result<(), CircuitOpenError> {
        let mut inner = self.inner.lock().unwrap();
        self.maybe_half_open(&mut inner);
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO);
            return Err(CircuitOpenError {
                name: self.name.clone(),
                recovery_in: self.recovery_timeout.saturating_sub(elapsed),
            });
        }
        Ok(())
    }

    /// Record a failure; opens the circuit when the windowed count
    /// reaches the threshold, and reopens immediately from HALF_OPEN.
    pub fn record_failure(&self, kind: &str) {
        let mut inner = self.inner.lock().unwrap();
        self.maybe_half_open(&mut inner);

        let now = Instant::now();
        inner.failures.push(FailureRecord {
            at: now,
            kind: kind.to_string(),
        });
        inner.total_failures += 1;
        self.compact_window(&mut inner);

        debug!(
            breaker = %self.name,
            kind,
            count = inner.failures.len(),
            threshold = self.failure_threshold,
            "failure recorded"
        );

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                warn!(breaker = %self.name, kind, "reopened from HALF_OPEN");
            }
            CircuitState::Closed if inner.failures.len() >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                warn!(
                    breaker = %self.name,
                    failures = inner.failures.len(),
                    last_kind = kind,
                    "circuit OPENED"
                );
            }
            _ => {}
        }
    }

    /// Record a success. Closes the circuit from HALF_OPEN and clears
    /// the window; in CLOSED the window is also reset.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.maybe_half_open(&mut inner);
        inner.total_successes += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                info!(breaker = %self.name, "CLOSED after successful recovery");
            }
            CircuitState::Closed => {
                inner.failures.clear();
            }
            CircuitState::Open => {}
        }
    }

    /// Failures currently inside the sliding window.
    pub fn failure_count(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        self.compact_window(&mut inner);
        inner.failures.len()
    }

    /// Manually reset to CLOSED.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        info!(breaker = %self.name, "manually reset to CLOSED");
    }

    /// Manually force OPEN (testing / emergency).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        warn!(breaker = %self.name, "manually forced OPEN");
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let mut inner = self.inner.lock().unwrap();
        self.maybe_half_open(&mut inner);
        self.compact_window(&mut inner);
        BreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failures.len(),
            failure_threshold: self.failure_threshold,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
        }
    }

    /// Most recent failure kinds inside the window, newest last.
    pub fn recent_failure_kinds(&self) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        self.compact_window(&mut inner);
        inner.failures.iter().map(|f| f.kind.clone()).collect()
    }

    fn maybe_half_open(&self, inner: &mut Inner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    info!(
                        breaker = %self.name,
                        timeout_secs = self.recovery_timeout.as_secs(),
                        "transitioned to HALF_OPEN"
                    );
                }
            }
        }
    }

    fn compact_window(&self, inner: &mut Inner) {
        // checked_sub: early in process lifetime the monotonic clock may
        // not reach back a full window.
        if let Some(cutoff) = Instant::now().checked_sub(self.failure_window) {
            inner.failures.retain(|f| f.at >= cutoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: usize, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            threshold,
            Duration::from_millis(recovery_ms),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn opens_exactly_at_threshold() {
        let cb = breaker(3, 60_000);
        cb.record_failure("503");
        cb.record_failure("503");
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure("timeout");
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check_state().is_err());
    }

    #[test]
    fn half_open_after_recovery_timeout() {
        let cb = breaker(1, 20);
        cb.record_failure("500");
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.check_state().is_ok());
    }

    #[test]
    fn success_in_half_open_closes_and_clears_window() {
        let cb = breaker(1, 10);
        cb.record_failure("500");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn failure_in_half_open_reopens() {
        let cb = breaker(1, 10);
        cb.record_failure("500");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_failure("503");
        assert_eq!(cb.state(), CircuitState::Open);
        // opened_at was refreshed — still open right away
        assert!(cb.check_state().is_err());
    }

    #[test]
    fn success_in_closed_resets_window() {
        let cb = breaker(3, 60_000);
        cb.record_failure("503");
        cb.record_failure("503");
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        cb.record_failure("503");
        cb.record_failure("503");
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn old_failures_fall_out_of_window() {
        let cb = CircuitBreaker::new(
            "test",
            2,
            Duration::from_secs(60),
            Duration::from_millis(20),
        );
        cb.record_failure("503");
        std::thread::sleep(Duration::from_millis(30));
        cb.record_failure("503");
        // first failure expired, only one inside the window
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 1);
    }

    #[test]
    fn force_open_and_reset() {
        let cb = breaker(5, 60_000);
        cb.force_open();
        assert!(cb.is_open());
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn metrics_track_totals() {
        let cb = breaker(5, 60_000);
        cb.record_failure("429");
        cb.record_success();
        let m = cb.metrics();
        assert_eq!(m.total_failures, 1);
        assert_eq!(m.total_successes, 1);
    }
}
