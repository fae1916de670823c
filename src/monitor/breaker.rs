//! Per-instance circuit breaker with a three-state lifecycle

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Current state of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, requests pass through
    Closed,
    /// Tripped, all requests fail fast
    Open,
    /// Testing, one request allowed through at a time
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

struct Inner {
    state: BreakerState,
    failure_count: u32,
    recovery_count: u32,
    opened_at: Option<Instant>,
    half_open_admitted: bool,
}

/// Circuit breaker tracking consecutive failures per protected instance.
///
/// Opens after `failure_threshold` consecutive failures and stays open for
/// `break_duration` before transitioning to half-open. In half-open, exactly
/// one probe request is admitted at a time, and `recovery_threshold`
/// consecutive successes are required before fully closing.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    recovery_threshold: u32,
    break_duration: Duration,
    clock: Clock,
}

impl CircuitBreaker {
    /// Breaker requiring a single success in half-open to close.
    pub fn new(failure_threshold: u32, break_duration: Duration) -> Self {
        Self::with_recovery(failure_threshold, 1, break_duration)
    }

    /// Breaker requiring `recovery_threshold` consecutive half-open successes
    /// before closing. The threshold is clamped to at least 1.
    pub fn with_recovery(
        failure_threshold: u32,
        recovery_threshold: u32,
        break_duration: Duration,
    ) -> Self {
        Self::with_clock(
            failure_threshold,
            recovery_threshold,
            break_duration,
            Arc::new(Instant::now),
        )
    }

    /// Breaker with an injected clock, for tests.
    pub fn with_clock(
        failure_threshold: u32,
        recovery_threshold: u32,
        break_duration: Duration,
        clock: Clock,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                recovery_count: 0,
                opened_at: None,
                half_open_admitted: false,
            }),
            failure_threshold,
            recovery_threshold: recovery_threshold.max(1),
            break_duration,
            clock,
        }
    }

    /// Whether a request should be allowed through.
    ///
    /// Returns true if the circuit is closed or has just transitioned to
    /// half-open. In half-open only one probe is admitted; further callers
    /// are refused until the probe outcome is recorded.
    pub fn allow(&self) -> bool {
        let now = (self.clock)();
        let mut inner = self.inner.lock();

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if inner.opened_at.is_some_and(|t| now - t >= self.break_duration) {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_admitted = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if !inner.half_open_admitted {
                    inner.half_open_admitted = true;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful request.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();

        inner.failure_count = 0;

        if inner.state == BreakerState::HalfOpen {
            inner.recovery_count += 1;
            if inner.recovery_count >= self.recovery_threshold {
                inner.state = BreakerState::Closed;
                inner.recovery_count = 0;
            }
            // Admit the next probe request.
            inner.half_open_admitted = false;
            return;
        }

        inner.state = BreakerState::Closed;
        inner.half_open_admitted = false;
    }

    /// Record a failed request. Opens the circuit at the failure threshold.
    pub fn record_failure(&self) {
        let now = (self.clock)();
        let mut inner = self.inner.lock();

        inner.failure_count += 1;
        inner.recovery_count = 0;

        if inner.state == BreakerState::HalfOpen || inner.failure_count >= self.failure_threshold {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            inner.half_open_admitted = false;
        }
    }

    /// Current state, advancing Open to HalfOpen once the break has elapsed.
    pub fn state(&self) -> BreakerState {
        let now = (self.clock)();
        let mut inner = self.inner.lock();

        if inner.state == BreakerState::Open
            && inner.opened_at.is_some_and(|t| now - t >= self.break_duration)
        {
            inner.state = BreakerState::HalfOpen;
        }
        inner.state
    }
}
